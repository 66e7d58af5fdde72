//! Outbound comment bodies
//!
//! The validation prompt is a handlebars template rendered per language;
//! the short lifecycle comments (merged, failed, abandoned, timeout,
//! unauthorized reply) are phrase tables. All bodies go through the
//! signature module before posting.

use handlebars::Handlebars;
use serde_json::json;
use std::sync::OnceLock;

use crate::domain::RunContext;

const VALIDATION_TEMPLATE_EN: &str = "\
{{#if creator_name}}@{{creator_name}} {{/if}}**Human validation required**

**Task**: {{title}}

**Workflow progress**:
{{#if changed_files}}- Modified files: {{changed_files}}
{{else}}- No modified files detected
{{/if}}{{#if tests_executed}}{{#if tests_passed}}- Tests executed successfully
{{else}}- Tests executed with errors
{{/if}}{{else}}- No tests executed
{{/if}}{{#if pr_url}}- Pull Request created: {{pr_url}}
{{else}}- Pull Request not created
{{/if}}
==================================================
**Reply to this update with**:
- 'yes' or 'validate' -> automatic merge
- 'no [instructions]' -> relaunch with modifications (max {{max_rejections}})
- 'abandon' or 'stop' -> end the workflow

Timeout: {{timeout_minutes}} minutes";

const VALIDATION_TEMPLATE_FR: &str = "\
{{#if creator_name}}@{{creator_name}} {{/if}}**Validation humaine requise**

**Tache**: {{title}}

**Avancement du workflow**:
{{#if changed_files}}- Fichiers modifies: {{changed_files}}
{{else}}- Aucun fichier modifie detecte
{{/if}}{{#if tests_executed}}{{#if tests_passed}}- Tests executes avec succes
{{else}}- Tests executes avec des erreurs
{{/if}}{{else}}- Aucun test execute
{{/if}}{{#if pr_url}}- Pull Request created: {{pr_url}}
{{else}}- Pull Request non creee
{{/if}}
==================================================
**Repondez a cette update avec**:
- 'oui' ou 'valide' -> merge automatique
- 'non [instructions]' -> relance avec modifications (max {{max_rejections}})
- 'abandon' ou 'stop' -> fin du workflow

Timeout: {{timeout_minutes}} minutes";

const VALIDATION_TEMPLATE_ES: &str = "\
{{#if creator_name}}@{{creator_name}} {{/if}}**Validacion humana requerida**

**Tarea**: {{title}}

**Progreso del workflow**:
{{#if changed_files}}- Archivos modificados: {{changed_files}}
{{else}}- No se detectaron archivos modificados
{{/if}}{{#if tests_executed}}{{#if tests_passed}}- Tests ejecutados con exito
{{else}}- Tests ejecutados con errores
{{/if}}{{else}}- Ningun test ejecutado
{{/if}}{{#if pr_url}}- Pull Request created: {{pr_url}}
{{else}}- Pull Request no creada
{{/if}}
==================================================
**Responda a esta update con**:
- 'si' o 'valida' -> merge automatico
- 'no [instrucciones]' -> relanzar con modificaciones (max {{max_rejections}})
- 'abandon' o 'stop' -> terminar el workflow

Timeout: {{timeout_minutes}} minutos";

fn templates() -> &'static Handlebars<'static> {
    static TEMPLATES: OnceLock<Handlebars<'static>> = OnceLock::new();
    TEMPLATES.get_or_init(|| {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string("validation_en", VALIDATION_TEMPLATE_EN)
            .expect("en template parses");
        handlebars
            .register_template_string("validation_fr", VALIDATION_TEMPLATE_FR)
            .expect("fr template parses");
        handlebars
            .register_template_string("validation_es", VALIDATION_TEMPLATE_ES)
            .expect("es template parses");
        handlebars
    })
}

fn template_for(language: &str) -> &'static str {
    match language {
        "fr" => "validation_fr",
        "es" => "validation_es",
        _ => "validation_en",
    }
}

/// Render the validation prompt for a finished workflow
pub fn validation_body(
    ctx: &RunContext,
    creator_name: Option<&str>,
    max_rejections: u32,
    timeout_minutes: u64,
) -> String {
    let tests = ctx.test_report.as_ref();
    let data = json!({
        "creator_name": creator_name,
        "title": ctx.title,
        "changed_files": if ctx.changed_files.is_empty() {
            None
        } else {
            Some(ctx.changed_files.join(", "))
        },
        "tests_executed": tests.map(|r| r.executed).unwrap_or(false),
        "tests_passed": tests.map(|r| r.passed).unwrap_or(false),
        "pr_url": ctx.pr.as_ref().map(|pr| pr.url.clone()),
        "max_rejections": max_rejections,
        "timeout_minutes": timeout_minutes,
    });

    templates()
        .render(template_for(&ctx.user_language), &data)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Validation template rendering failed");
            format!("Human validation required for: {}", ctx.title)
        })
}

/// Comment posted after a successful merge
pub fn merged_comment(language: &str, pr_url: &str) -> String {
    match language {
        "fr" => format!("PR merged - workflow termine avec succes.\nPull Request: {}", pr_url),
        "es" => format!("PR merged - workflow completado con exito.\nPull Request: {}", pr_url),
        _ => format!("PR merged - workflow completed successfully.\nPull Request: {}", pr_url),
    }
}

/// Comment posted when a run fails at a stage
pub fn failure_comment(language: &str, stage: &str, reason: &str) -> String {
    match language {
        "fr" => format!("Le workflow a echoue a l'etape '{}': {}", stage, reason),
        "es" => format!("El workflow fallo en la etapa '{}': {}", stage, reason),
        _ => format!("The workflow failed at stage '{}': {}", stage, reason),
    }
}

/// Comment posted when a run is abandoned
pub fn abandoned_comment(language: &str, reason: &str) -> String {
    match language {
        "fr" => format!("Workflow abandonne: {}", reason),
        "es" => format!("Workflow abandonado: {}", reason),
        _ => format!("Workflow abandoned: {}", reason),
    }
}

/// Reason text for the rejection-limit abandon
pub fn rejection_limit_reason(language: &str, max_rejections: u32) -> String {
    match language {
        "fr" => format!("limite de {} rejets atteinte", max_rejections),
        "es" => format!("limite de {} rechazos alcanzado", max_rejections),
        _ => format!("{}-rejection limit reached", max_rejections),
    }
}

/// Comment posted when no authorized reply arrived in time
pub fn timeout_comment(language: &str, timeout_minutes: u64) -> String {
    match language {
        "fr" => format!(
            "Validation expiree: aucune reponse autorisee recue en {} minutes. Le workflow est marque en echec.",
            timeout_minutes
        ),
        "es" => format!(
            "Validacion expirada: ninguna respuesta autorizada recibida en {} minutos. El workflow queda en fallo.",
            timeout_minutes
        ),
        _ => format!(
            "Validation expired: no authorized reply received within {} minutes. The workflow is marked failed.",
            timeout_minutes
        ),
    }
}

/// Comment naming both parties when an unauthorized user replies
pub fn unauthorized_reply_comment(
    creator_name: &str,
    intruder_name: &str,
    task_title: &str,
) -> String {
    format!(
        "@{creator} - another user is trying to answer in your place for \"{title}\".\n\n\
         @{intruder} - you cannot respond to this validation because you are not the creator \
         of the request.\n\n\
         Only the creator of the validation can reply to it.",
        creator = creator_name,
        intruder = intruder_name,
        title = task_title,
    )
}

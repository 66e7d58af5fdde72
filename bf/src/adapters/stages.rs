//! Concrete stage adapters
//!
//! Each adapter reads what it needs from the run context and returns a
//! typed output. Content-producing work (plans, change drafts) goes to the
//! LLM; test and qa run the project's own commands; git and pull-request
//! work goes through the code host.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::{AnalysisPlan, QaReport, RunContext, StageName, TestReport};
use crate::llm::{CompletionRequest, LlmClient, LlmMessage};

use super::command::run_command;
use super::{AdapterError, CodeHost, StageAdapter, StageOutput};

/// Resolves the working directory, clones the repository, creates the
/// feature branch
pub struct PrepareAdapter {
    codehost: Arc<dyn CodeHost>,
    workdir_base: PathBuf,
    branch_prefix: String,
}

impl PrepareAdapter {
    pub fn new(codehost: Arc<dyn CodeHost>, workdir_base: PathBuf, branch_prefix: impl Into<String>) -> Self {
        Self {
            codehost,
            workdir_base,
            branch_prefix: branch_prefix.into(),
        }
    }
}

#[async_trait]
impl StageAdapter for PrepareAdapter {
    fn name(&self) -> StageName {
        StageName::Prepare
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, AdapterError> {
        if ctx.repository_url.is_empty() {
            return Err(AdapterError::Logical {
                message: "Task has no repository URL".to_string(),
                retryable: false,
            });
        }

        let workdir = self.workdir_base.join(&ctx.run_id);
        self.codehost.clone_repo(&ctx.repository_url, &workdir).await?;

        let branch = format!("{}/{}", self.branch_prefix, ctx.run_id);
        self.codehost.create_branch(&workdir, &branch).await?;

        info!(run_id = %ctx.run_id, branch, "Prepared working directory");
        Ok(StageOutput::Prepared {
            workdir: workdir.to_string_lossy().to_string(),
            branch,
        })
    }
}

/// Produces a structured plan from the task description
pub struct AnalyzeAdapter {
    llm: Option<Arc<dyn LlmClient>>,
}

impl AnalyzeAdapter {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    fn fallback_plan(ctx: &RunContext) -> AnalysisPlan {
        AnalysisPlan {
            summary: ctx.title.clone(),
            file_touches: Vec::new(),
            risks: Vec::new(),
            ambiguities: vec!["No model available; plan derived from the title only".to_string()],
        }
    }
}

#[async_trait]
impl StageAdapter for AnalyzeAdapter {
    fn name(&self) -> StageName {
        StageName::Analyze
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, AdapterError> {
        let Some(llm) = &self.llm else {
            return Ok(StageOutput::Analyzed {
                plan: Self::fallback_plan(ctx),
            });
        };

        let system_prompt = "You are a software planning assistant. Given a task, output ONLY a \
                             JSON object with keys: summary (string), file_touches (array of \
                             strings), risks (array of strings), ambiguities (array of strings).";
        let mut prompt = format!("Task: {}\n\n{}", ctx.title, ctx.description);
        for instructions in &ctx.modification_instructions {
            prompt.push_str(&format!("\n\nRequested modification: {}", instructions));
        }

        let request = CompletionRequest {
            system_prompt: system_prompt.to_string(),
            messages: vec![LlmMessage::user(prompt)],
            max_tokens: 2048,
        };

        let plan = match llm.complete(request).await {
            Ok(response) => response
                .content
                .and_then(|text| extract_json(&text))
                .and_then(|value| serde_json::from_value::<AnalysisPlan>(value).ok())
                .unwrap_or_else(|| Self::fallback_plan(ctx)),
            Err(e) if e.is_retryable() => return Err(AdapterError::Llm(e)),
            Err(e) => {
                warn!(error = %e, "Analyze model call failed, using fallback plan");
                Self::fallback_plan(ctx)
            }
        };

        Ok(StageOutput::Analyzed { plan })
    }
}

/// Produces code changes in the working directory
pub struct ImplementAdapter {
    llm: Option<Arc<dyn LlmClient>>,
    codehost: Arc<dyn CodeHost>,
}

impl ImplementAdapter {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, codehost: Arc<dyn CodeHost>) -> Self {
        Self { llm, codehost }
    }
}

#[async_trait]
impl StageAdapter for ImplementAdapter {
    fn name(&self) -> StageName {
        StageName::Implement
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, AdapterError> {
        let workdir = ctx.workdir.as_deref().ok_or_else(|| AdapterError::Logical {
            message: "Implement stage requires a prepared working directory".to_string(),
            retryable: false,
        })?;

        if let Some(llm) = &self.llm {
            let plan_summary = ctx.plan.as_ref().map(|p| p.summary.as_str()).unwrap_or(&ctx.title);
            let mut prompt = format!(
                "Apply the following change to the repository at {}.\nPlan: {}\nTask: {}",
                workdir, plan_summary, ctx.description
            );
            for instructions in &ctx.modification_instructions {
                prompt.push_str(&format!("\nModification requested by reviewer: {}", instructions));
            }

            let request = CompletionRequest {
                system_prompt: "You are a code-generation agent with write access to the working directory."
                    .to_string(),
                messages: vec![LlmMessage::user(prompt)],
                max_tokens: 4096,
            };
            match llm.complete(request).await {
                Ok(_) => debug!(run_id = %ctx.run_id, "Implement model call finished"),
                Err(e) if e.is_retryable() => return Err(AdapterError::Llm(e)),
                Err(e) => warn!(error = %e, "Implement model call failed, relying on workdir state"),
            }
        }

        let changed_files = self.codehost.changed_files(std::path::Path::new(workdir)).await?;
        info!(run_id = %ctx.run_id, count = changed_files.len(), "Implementation produced changes");
        Ok(StageOutput::Implemented { changed_files })
    }
}

/// Runs the project's own test suite
pub struct TestAdapter {
    command: String,
}

impl TestAdapter {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

#[async_trait]
impl StageAdapter for TestAdapter {
    fn name(&self) -> StageName {
        StageName::Test
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, AdapterError> {
        if self.command.trim().is_empty() {
            debug!(run_id = %ctx.run_id, "No test command configured, skipping");
            return Ok(StageOutput::Tested {
                report: TestReport::default(),
            });
        }

        let workdir = ctx.workdir.as_deref().ok_or_else(|| AdapterError::Logical {
            message: "Test stage requires a prepared working directory".to_string(),
            retryable: false,
        })?;

        let result = run_command(&self.command, std::path::Path::new(workdir), self.timeout())
            .await
            .map_err(|e| AdapterError::Logical {
                message: e.to_string(),
                retryable: true,
            })?;

        let report = TestReport {
            executed: true,
            passed: result.passed(),
            total: 0,
            failed: u32::from(!result.passed()),
            log_excerpt: result.log_excerpt(2000),
        };
        info!(run_id = %ctx.run_id, passed = report.passed, "Test suite finished");
        Ok(StageOutput::Tested { report })
    }
}

/// Attempts a fix after a failing test stage
pub struct DebugAdapter {
    llm: Option<Arc<dyn LlmClient>>,
}

impl DebugAdapter {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl StageAdapter for DebugAdapter {
    fn name(&self) -> StageName {
        StageName::Debug
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, AdapterError> {
        let failure = ctx
            .test_report
            .as_ref()
            .map(|r| r.log_excerpt.clone())
            .unwrap_or_default();

        let note = if let Some(llm) = &self.llm {
            let request = CompletionRequest {
                system_prompt: "You are a debugging agent. Fix the failing tests in the working directory."
                    .to_string(),
                messages: vec![LlmMessage::user(format!(
                    "Working directory: {}\nTest failure output:\n{}",
                    ctx.workdir.as_deref().unwrap_or("unknown"),
                    failure
                ))],
                max_tokens: 4096,
            };
            match llm.complete(request).await {
                Ok(response) => response.content.unwrap_or_else(|| "fix attempted".to_string()),
                Err(e) if e.is_retryable() => return Err(AdapterError::Llm(e)),
                Err(e) => format!("model unavailable: {}", e),
            }
        } else {
            "no model available, re-running tests".to_string()
        };

        debug!(run_id = %ctx.run_id, attempt = ctx.debug_attempts + 1, "Debug attempt finished");
        Ok(StageOutput::Debugged { note })
    }
}

/// Runs static / browser-based quality checks
pub struct QaAdapter {
    command: String,
}

impl QaAdapter {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

#[async_trait]
impl StageAdapter for QaAdapter {
    fn name(&self) -> StageName {
        StageName::Qa
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, AdapterError> {
        if self.command.trim().is_empty() {
            return Ok(StageOutput::QaChecked {
                report: QaReport {
                    passed: true,
                    findings: Vec::new(),
                },
            });
        }

        let workdir = ctx.workdir.as_deref().ok_or_else(|| AdapterError::Logical {
            message: "Qa stage requires a prepared working directory".to_string(),
            retryable: false,
        })?;

        let result = run_command(&self.command, std::path::Path::new(workdir), self.timeout())
            .await
            .map_err(|e| AdapterError::Logical {
                message: e.to_string(),
                retryable: true,
            })?;

        let findings = if result.passed() {
            Vec::new()
        } else {
            vec![result.log_excerpt(1000)]
        };
        Ok(StageOutput::QaChecked {
            report: QaReport {
                passed: result.passed(),
                findings,
            },
        })
    }
}

/// Commits, pushes, and opens the pull request
pub struct FinalizePrAdapter {
    codehost: Arc<dyn CodeHost>,
}

impl FinalizePrAdapter {
    pub fn new(codehost: Arc<dyn CodeHost>) -> Self {
        Self { codehost }
    }
}

#[async_trait]
impl StageAdapter for FinalizePrAdapter {
    fn name(&self) -> StageName {
        StageName::FinalizePr
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(180)
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, AdapterError> {
        let workdir = ctx.workdir.as_deref().map(std::path::Path::new).ok_or_else(|| {
            AdapterError::Logical {
                message: "Finalize stage requires a prepared working directory".to_string(),
                retryable: false,
            }
        })?;
        let branch = ctx.branch.as_deref().ok_or_else(|| AdapterError::Logical {
            message: "Finalize stage requires a feature branch".to_string(),
            retryable: false,
        })?;

        let message = format!("{}\n\nAutomated change for board item {}", ctx.title, ctx.external_item_id);
        self.codehost.commit_all(workdir, &message).await?;
        self.codehost.push(workdir, branch).await?;

        let body = ctx
            .plan
            .as_ref()
            .map(|p| p.summary.clone())
            .unwrap_or_else(|| ctx.description.clone());
        let pr = self
            .codehost
            .open_pull_request(&ctx.repository_url, branch, &ctx.title, &body)
            .await?;

        info!(run_id = %ctx.run_id, pr = pr.number, "Pull request finalized");
        Ok(StageOutput::PrFinalized { pr })
    }
}

/// Merges the approved pull request
pub struct MergeAdapter {
    codehost: Arc<dyn CodeHost>,
}

impl MergeAdapter {
    pub fn new(codehost: Arc<dyn CodeHost>) -> Self {
        Self { codehost }
    }
}

#[async_trait]
impl StageAdapter for MergeAdapter {
    fn name(&self) -> StageName {
        StageName::Merge
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, AdapterError> {
        let pr = ctx.pr.as_ref().ok_or_else(|| AdapterError::Logical {
            message: "Merge stage requires an open pull request".to_string(),
            retryable: false,
        })?;

        self.codehost.merge_pull_request(&ctx.repository_url, pr).await?;
        info!(run_id = %ctx.run_id, pr = pr.number, "Pull request merged");
        Ok(StageOutput::Merged { pr_url: pr.url.clone() })
    }
}

/// Pull the first JSON object out of a model reply
fn extract_json(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Run, Task};
    use crate::llm::MockLlmClient;

    fn make_ctx() -> RunContext {
        let task = Task::new(1, "Add endpoint", "Please add /v1/health")
            .with_repository("https://example.com/acme/svc.git");
        let run = Run::new(&task.id);
        RunContext::from_task_run(&task, &run)
    }

    #[test]
    fn test_extract_json() {
        let text = "Here is the plan:\n{\"summary\": \"s\", \"file_touches\": [], \"risks\": [], \"ambiguities\": []}\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["summary"], "s");

        assert!(extract_json("no json here").is_none());
        assert!(extract_json("} backwards {").is_none());
    }

    #[tokio::test]
    async fn test_analyze_without_model_uses_fallback() {
        let adapter = AnalyzeAdapter::new(None);
        let ctx = make_ctx();

        let output = adapter.invoke(&ctx).await.unwrap();
        match output {
            StageOutput::Analyzed { plan } => {
                assert_eq!(plan.summary, "Add endpoint");
                assert!(!plan.ambiguities.is_empty());
            }
            other => panic!("Unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analyze_parses_model_json() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec![
            r#"{"summary": "add health route", "file_touches": ["src/routes.rs"], "risks": [], "ambiguities": []}"#
                .to_string(),
        ]));
        let adapter = AnalyzeAdapter::new(Some(llm));
        let ctx = make_ctx();

        let output = adapter.invoke(&ctx).await.unwrap();
        match output {
            StageOutput::Analyzed { plan } => {
                assert_eq!(plan.summary, "add health route");
                assert_eq!(plan.file_touches, vec!["src/routes.rs".to_string()]);
            }
            other => panic!("Unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_test_adapter_skips_without_command() {
        let adapter = TestAdapter::new("");
        let ctx = make_ctx();

        let output = adapter.invoke(&ctx).await.unwrap();
        match output {
            StageOutput::Tested { report } => {
                assert!(!report.executed);
                assert!(!report.passed);
            }
            other => panic!("Unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_test_adapter_runs_command() {
        let temp = tempfile::tempdir().unwrap();
        let adapter = TestAdapter::new("echo 'all green'");
        let mut ctx = make_ctx();
        ctx.workdir = Some(temp.path().to_string_lossy().to_string());

        let output = adapter.invoke(&ctx).await.unwrap();
        match output {
            StageOutput::Tested { report } => {
                assert!(report.executed);
                assert!(report.passed);
                assert!(report.log_excerpt.contains("all green"));
            }
            other => panic!("Unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_test_adapter_reports_failure() {
        let temp = tempfile::tempdir().unwrap();
        let adapter = TestAdapter::new("exit 1");
        let mut ctx = make_ctx();
        ctx.workdir = Some(temp.path().to_string_lossy().to_string());

        let output = adapter.invoke(&ctx).await.unwrap();
        match output {
            StageOutput::Tested { report } => {
                assert!(report.executed);
                assert!(!report.passed);
                assert_eq!(report.failed, 1);
            }
            other => panic!("Unexpected output: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_implement_requires_workdir() {
        let codehost: Arc<dyn CodeHost> = Arc::new(crate::adapters::GitCliHost::from_config(
            &crate::config::CodeHostConfig::default(),
        ).unwrap());
        let adapter = ImplementAdapter::new(None, codehost);
        let ctx = make_ctx();

        let err = adapter.invoke(&ctx).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_merge_requires_pr() {
        let codehost: Arc<dyn CodeHost> = Arc::new(crate::adapters::GitCliHost::from_config(
            &crate::config::CodeHostConfig::default(),
        ).unwrap());
        let adapter = MergeAdapter::new(codehost);
        let ctx = make_ctx();

        let err = adapter.invoke(&ctx).await.unwrap_err();
        assert!(matches!(err, AdapterError::Logical { retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_qa_adapter_collects_findings_on_failure() {
        let temp = tempfile::tempdir().unwrap();
        let adapter = QaAdapter::new("echo 'lint: unused variable' && exit 1");
        let mut ctx = make_ctx();
        ctx.workdir = Some(temp.path().to_string_lossy().to_string());

        let output = adapter.invoke(&ctx).await.unwrap();
        match output {
            StageOutput::QaChecked { report } => {
                assert!(!report.passed);
                assert!(report.findings[0].contains("unused variable"));
            }
            other => panic!("Unexpected output: {:?}", other),
        }
    }
}

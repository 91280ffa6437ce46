use anyhow::Result;

use crate::agent::LoopOutcome;
use crate::history::{now_ts, ExecutionRecord, HistoryStore};
use crate::roles::AgentRole;
use crate::task::Task;

/// Closes the loop between execution and selection: every agent run becomes
/// an execution record, which the recommender mines on the next query.
pub struct OutcomeLogger {
    store: HistoryStore,
}

impl OutcomeLogger {
    pub fn new(store: HistoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Record one agent run. Called on every exit path, success or not, so
    /// history reflects attempts rather than just wins.
    pub fn record(
        &self,
        task: &Task,
        backend: &str,
        model: &str,
        role: AgentRole,
        outcome: &LoopOutcome,
        latency_ms: u64,
    ) -> Result<()> {
        let record = ExecutionRecord {
            timestamp: now_ts(),
            task_fingerprint: task.fingerprint.clone(),
            backend: backend.to_string(),
            model: model.to_string(),
            agent_role: role.as_str().to_string(),
            success: outcome.completed(),
            error_kind: outcome.error_kind,
            latency_ms,
            tool_calls_count: outcome.invocations.len() as u32,
            tokens_in: outcome.usage.input_tokens,
            tokens_out: outcome.usage.output_tokens,
        };
        tracing::debug!(
            backend,
            model,
            role = %role,
            success = record.success,
            "recording execution"
        );
        self.store.append(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LoopPhase;
    use crate::errors::ErrorKind;
    use maestro_provider::Usage;

    fn outcome(completed: bool, error_kind: Option<ErrorKind>) -> LoopOutcome {
        LoopOutcome {
            final_text: String::new(),
            invocations: vec![],
            phase: if completed { LoopPhase::Done } else { LoopPhase::Error },
            error_kind,
            iterations: 2,
            usage: Usage {
                input_tokens: 300,
                output_tokens: 40,
            },
        }
    }

    #[test]
    fn records_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        let logger = OutcomeLogger::new(store);
        let task = Task::new("create hello.txt");

        logger
            .record(
                &task,
                "x",
                "m1",
                AgentRole::Editor,
                &outcome(false, Some(ErrorKind::ToolNotAvailable)),
                800,
            )
            .unwrap();
        logger
            .record(&task, "y", "m2", AgentRole::Editor, &outcome(true, None), 900)
            .unwrap();

        let records = logger.store().recent(10).unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].success);
        assert_eq!(records[0].error_kind, Some(ErrorKind::ToolNotAvailable));
        assert!(records[1].success);
        assert_eq!(records[1].task_fingerprint, task.fingerprint);
        assert_eq!(records[1].tokens_in, 300);
    }
}

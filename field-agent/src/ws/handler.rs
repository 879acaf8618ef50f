//! WebSocket command handlers.

use super::{AgentEvent, WsCommand};
use crate::api::{status, AppState};
use tracing::info;

/// Handle a command from a connected client
pub async fn handle_command(command: WsCommand, state: &AppState) {
    match command {
        WsCommand::TriggerSync => {
            info!("Sync requested over WebSocket");
            state.sync.trigger();
        }
        WsCommand::PauseSync => {
            info!("Pause requested over WebSocket");
            state.sync.pause();
        }
        WsCommand::ResumeSync => {
            info!("Resume requested over WebSocket");
            state.sync.resume();
        }
        WsCommand::StartSync => {
            info!("Start requested over WebSocket");
            state.sync.start().await;
        }
        WsCommand::GetStatus => {
            let report = status::collect(state).await;
            state.events.publish(AgentEvent::Status(report));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::test_state;
    use crate::supervisor::{SupervisorHandle, SupervisorState};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_pause_and_resume_commands() {
        let (state, task) = test_state().await;

        handle_command(WsCommand::PauseSync, &state).await;
        assert_eq!(task.state(), SupervisorState::Paused);

        handle_command(WsCommand::ResumeSync, &state).await;
        assert_eq!(task.state(), SupervisorState::Running);

        handle_command(WsCommand::TriggerSync, &state).await;
        assert_eq!(task.triggers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_command_leaves_error_state() {
        let (state, task) = test_state().await;
        *task.state.lock().unwrap() = SupervisorState::Error;

        let command: WsCommand = serde_json::from_str(r#"{"type":"sync:start"}"#).unwrap();
        handle_command(command, &state).await;
        assert_eq!(task.state(), SupervisorState::Running);
    }

    #[tokio::test]
    async fn test_status_command_publishes_report() {
        let (state, _task) = test_state().await;
        let mut rx = state.events.subscribe();

        handle_command(WsCommand::GetStatus, &state).await;

        match rx.recv().await.unwrap() {
            AgentEvent::Status(report) => assert_eq!(report.agent_id, "test-agent"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}

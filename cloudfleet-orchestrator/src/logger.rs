use uuid::Uuid;

/// Tracing target carrying the action log.
pub const ACTION_TARGET: &str = "cloudfleet::actions";

/// Simple action logger: one structured event per externally visible action.
pub fn log_event(
    action_type: &str,
    status: &str,
    instance_id: Option<&str>,
    metadata: serde_json::Value,
) -> Uuid {
    log_event_with_error(action_type, status, instance_id, None, metadata)
}

/// Log event with an error message (failed actions).
pub fn log_event_with_error(
    action_type: &str,
    status: &str,
    instance_id: Option<&str>,
    error_message: Option<&str>,
    metadata: serde_json::Value,
) -> Uuid {
    let log_id = Uuid::new_v4();
    let instance_id = instance_id.unwrap_or("-");

    match error_message {
        Some(error) => tracing::warn!(
            target: ACTION_TARGET,
            %log_id,
            action_type,
            status,
            instance_id,
            error,
            metadata = %metadata,
            "📝 {} - {} ({})",
            action_type,
            status,
            instance_id
        ),
        None => tracing::info!(
            target: ACTION_TARGET,
            %log_id,
            action_type,
            status,
            instance_id,
            metadata = %metadata,
            "📝 {} - {} ({})",
            action_type,
            status,
            instance_id
        ),
    }
    log_id
}

/// Quick log for state transitions of a launch attempt.
pub fn log_state_transition(
    cloud: &str,
    template: &str,
    instance_id: Option<&str>,
    from_status: &str,
    to_status: &str,
    reason: &str,
) {
    tracing::debug!(
        target: ACTION_TARGET,
        cloud,
        template,
        instance_id = instance_id.unwrap_or("-"),
        from_status,
        to_status,
        reason,
        "🔄 [state_machine] {} -> {}",
        from_status,
        to_status
    );
}

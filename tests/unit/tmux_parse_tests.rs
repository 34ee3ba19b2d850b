use epic_conductor::gateway::tmux::{
    is_idle_shell, parse_environment, parse_session_line, ENV_AGENT_TYPE, ENV_ISSUE_REF,
    ENV_STARTED_AT,
};

#[test]
fn shells_are_idle() {
    assert!(is_idle_shell("bash"));
    assert!(is_idle_shell("-zsh"));
    assert!(is_idle_shell(""));
    assert!(!is_idle_shell("claude"));
    assert!(!is_idle_shell("node"));
}

#[test]
fn session_lines() {
    assert_eq!(
        parse_session_line("conductor-agent-4\t1"),
        Some(("conductor-agent-4".to_owned(), true))
    );
    assert_eq!(
        parse_session_line("conductor-agent-5\t0"),
        Some(("conductor-agent-5".to_owned(), false))
    );
    assert_eq!(parse_session_line(""), None);
}

#[test]
fn environment_metadata() {
    let output = format!(
        "{ENV_ISSUE_REF}=acme/tracking#4\n{ENV_AGENT_TYPE}=claude\n{ENV_STARTED_AT}=2026-01-02T03:04:05Z\nTERM=xterm\n-CONDUCTOR_REPO\n"
    );
    let metadata = parse_environment(&output).expect("engine keys present");
    assert_eq!(metadata.issue_number(), Some(4));
    assert_eq!(metadata.agent_type.as_deref(), Some("claude"));
    assert!(metadata.started_at.is_some());
    assert!(metadata.repo.is_none());

    assert!(parse_environment("TERM=xterm\nHOME=/root\n").is_none());
}

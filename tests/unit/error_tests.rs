//! Unit tests for `AppError` display and retry classification.

use pincerna_uploader::AppError;

#[test]
fn display_uses_lowercase_kind_prefix() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::InvalidInput("x".into()), "invalid input: x"),
        (AppError::InvalidTransition("x".into()), "invalid transition: x"),
        (AppError::Transport("x".into()), "transport: x"),
        (AppError::Finalize("x".into()), "finalize: x"),
        (AppError::SessionFailed("x".into()), "session failed: x"),
        (AppError::Cancelled("x".into()), "cancelled: x"),
        (AppError::Unauthorized("x".into()), "unauthorized: x"),
        (AppError::PathViolation("x".into()), "path violation: x"),
        (AppError::NotFound("x".into()), "not found: x"),
        (AppError::Io("x".into()), "io: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn only_transport_errors_are_retryable() {
    assert!(AppError::Transport("reset".into()).is_retryable());
    for err in [
        AppError::Unauthorized("401".into()),
        AppError::Finalize("missing".into()),
        AppError::Io("read".into()),
        AppError::InvalidTransition("bad".into()),
        AppError::Cancelled("stop".into()),
    ] {
        assert!(!err.is_retryable(), "{err} must not be retryable");
    }
}

#[test]
fn toml_errors_convert_to_config() {
    let parse: Result<toml::Value, _> = toml::from_str("= nope");
    let err = AppError::from(parse.expect_err("invalid toml"));
    assert!(matches!(err, AppError::Config(_)));
}

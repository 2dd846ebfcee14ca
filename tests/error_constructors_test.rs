use chargebill::error::ChargeError;
use rust_decimal_macros::dec;

#[test]
fn error_constructors_group_1() {
    assert!(matches!(
        ChargeError::insufficient_balance(dec!(10), dec!(0.01)),
        ChargeError::InsufficientBalance { .. }
    ));
    assert!(matches!(
        ChargeError::charger_unavailable("Offline"),
        ChargeError::ChargerUnavailable { .. }
    ));
    assert!(matches!(
        ChargeError::session_not_found("session-x"),
        ChargeError::SessionNotFound { .. }
    ));
    assert!(matches!(
        ChargeError::invalid_transition("Completed", "stop"),
        ChargeError::InvalidTransition { .. }
    ));
}

#[test]
fn error_constructors_group_2() {
    assert!(matches!(
        ChargeError::insufficient_funds(dec!(5), dec!(1)),
        ChargeError::InsufficientFunds { .. }
    ));
    assert!(matches!(
        ChargeError::persistence("x"),
        ChargeError::Persistence { .. }
    ));
    assert!(matches!(ChargeError::sampler("x"), ChargeError::Sampler { .. }));
    assert!(matches!(ChargeError::config("x"), ChargeError::Config { .. }));
    assert!(matches!(ChargeError::io("x"), ChargeError::Io { .. }));
    assert!(matches!(ChargeError::web("x"), ChargeError::Web { .. }));
}

#[test]
fn only_storage_errors_are_transient() {
    assert!(ChargeError::persistence("x").is_transient());
    assert!(ChargeError::io("x").is_transient());
    assert!(!ChargeError::validation("f", "m").is_transient());
    assert!(!ChargeError::insufficient_balance(dec!(10), dec!(0)).is_transient());
}

#[test]
fn display_messages() {
    let e = ChargeError::validation("field", "bad");
    assert!(format!("{}", e).contains("Validation error"));

    let e = ChargeError::invalid_transition("Completed", "stop");
    assert_eq!(
        e.to_string(),
        "Invalid transition: cannot stop a session that is Completed"
    );
}

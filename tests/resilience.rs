//! Handshake steps of a live emulator driven through the timeout and retry
//! wrappers.

use emrtd_emulator::{
    pace::{PaceState, StepResult},
    resilience::{
        CorrelationId, RetryManager, RetryPolicy, StepOutcome, TimeoutConfig, TimeoutManager,
    },
    DocumentRecord, EmulatorConfig, PassportEmulator, SimulatorError,
};
use hex_literal::hex;
use std::time::Duration;

fn emulator() -> Result<PassportEmulator, SimulatorError> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut emulator = PassportEmulator::new(EmulatorConfig::default());
    emulator.load_document(&DocumentRecord {
        document_number: "T22000129".into(),
        date_of_birth: "640812".into(),
        date_of_expiry: "101031".into(),
        ..DocumentRecord::default()
    })?;
    Ok(emulator)
}

#[tokio::test]
async fn test_steps_under_deadline() -> Result<(), SimulatorError> {
    let emulator = emulator()?;
    let timeouts = TimeoutManager::new(TimeoutConfig::default().with_step_timeout(Duration::from_secs(2)));

    let outcome = timeouts
        .run_step(
            emulator.pace_session(),
            "pace.mse_set_at",
            CorrelationId::new(),
            |session| session.process_mse_set_at(&hex!("800A04007F00070202040202")),
        )
        .await;
    assert!(matches!(outcome, StepOutcome::Completed(StepResult { next_step: 2, .. })));

    let nonce = timeouts
        .run_step(
            emulator.pace_session(),
            "pace.nonce",
            CorrelationId::new(),
            |session| session.generate_encrypted_nonce(),
        )
        .await
        .into_result()?;
    assert_eq!(nonce.data.len(), 16);
    assert_eq!(
        emulator.pace_session().with(|session| session.state()),
        PaceState::NonceGenerated
    );
    assert_eq!(timeouts.active_operations(), 0);
    Ok(())
}

#[tokio::test]
async fn test_retry_around_steps() -> Result<(), SimulatorError> {
    let emulator = emulator()?;
    let timeouts = TimeoutManager::default();
    let retries = RetryManager::new(RetryPolicy::default().with_base_delay(Duration::from_millis(1)));

    let handle = emulator.pace_session().clone();
    let timeouts = &timeouts;
    let result = retries
        .execute("pace.mse_set_at", move || {
            let handle = handle.clone();
            async move {
                timeouts
                    .run_step(&handle, "pace.mse_set_at", CorrelationId::new(), |session| {
                        session.process_mse_set_at(&hex!("800A04007F00070202040202"))
                    })
                    .await
                    .into_result()
            }
        })
        .await;
    assert!(result.is_ok_and(|step| step.next_step == 2));

    // Repeating the step is a wrong-state call: not retried, session unchanged.
    let handle = emulator.pace_session().clone();
    let result = retries
        .execute("pace.mse_set_at", move || {
            let handle = handle.clone();
            async move {
                timeouts
                    .run_step(&handle, "pace.mse_set_at", CorrelationId::new(), |session| {
                        session.process_mse_set_at(&hex!("800A04007F00070202040202"))
                    })
                    .await
                    .into_result()
            }
        })
        .await;
    assert!(result.is_err_and(|failure| {
        !failure.retryable
            && failure.attempts == 1
            && matches!(failure.error, SimulatorError::InvalidState { .. })
    }));
    assert_eq!(
        emulator.pace_session().with(|session| session.state()),
        PaceState::MseSetAtProcessed
    );
    Ok(())
}

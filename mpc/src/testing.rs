use std::sync::Arc;

use ndarray::ArrayD;
use tracing_subscriber::EnvFilter;

use crate::{
    plaintext::PlaintextComparison,
    provider::{PrimitiveProvider, PrimitiveRegistry},
    session::Session,
    transport::LocalTransport,
    SessionConfig,
};

/// Tolerance of decoded results after fixed-point truncation.
pub const TOLERANCE: f64 = 1e-3;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Session over in-process parties, not yet set up.
pub fn unready_session(nr_parties: usize) -> Session {
    init_tracing();
    let provider = PrimitiveProvider::with_seed(PrimitiveRegistry::with_defaults(), 42);
    Session::new(
        SessionConfig::default(),
        Arc::new(LocalTransport::spawn(nr_parties)),
        Arc::new(provider),
    )
    .unwrap()
    .with_comparison(Arc::new(PlaintextComparison::new()))
}

pub async fn test_session(nr_parties: usize) -> Arc<Session> {
    let session = unready_session(nr_parties);
    session.setup().await.unwrap();
    Arc::new(session)
}

#[track_caller]
pub fn assert_close(actual: &ArrayD<f64>, expected: &ArrayD<f64>) {
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < TOLERANCE, "got {actual}, expected {expected}");
    }
}

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, Encoder, IntCounterVec, Registry, TextEncoder,
};

// Create a new registry named `powpeg`
lazy_static! {
    pub static ref POWPEG_REGISTRY: Registry =
        Registry::new_custom(Some("powpeg".to_string()), None).unwrap();
}

// Register metrics with the `powpeg` registry
lazy_static! {
    pub static ref RELEASE_BUILDS: IntCounterVec = register_int_counter_vec_with_registry!(
        "release_builds_total",
        "Release transaction builds labeled by kind (amount_to, empty_wallet, batched_pegouts, migration) and response code",
        &["kind", "response"],
        POWPEG_REGISTRY
    )
    .unwrap();
    pub static ref SIGNATURE_SUBMISSIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "signature_submissions_total",
        "Federator signature submissions labeled by outcome",
        &["outcome"],
        POWPEG_REGISTRY
    )
    .unwrap();
    pub static ref CLASSIFIED_TRANSACTIONS: IntCounterVec =
        register_int_counter_vec_with_registry!(
            "classified_transactions_total",
            "Bitcoin transactions classified by peg role",
            &["type"],
            POWPEG_REGISTRY
        )
        .unwrap();
}

/// Text exposition of every metric in the `powpeg` registry.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let mut buffer = vec![];
    TextEncoder::new().encode(&POWPEG_REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported_with_prefix() {
        RELEASE_BUILDS
            .with_label_values(&["migration", "success"])
            .inc();
        SIGNATURE_SUBMISSIONS
            .with_label_values(&["partially_signed"])
            .inc();
        CLASSIFIED_TRANSACTIONS.with_label_values(&["unknown"]).inc();

        let exported = gather_metrics().unwrap();
        assert!(exported.contains("powpeg_release_builds_total"));
        assert!(exported.contains("powpeg_signature_submissions_total"));
        assert!(exported.contains("powpeg_classified_transactions_total"));
    }
}

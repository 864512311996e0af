use std::collections::BTreeMap;

pub fn graceful_shutdown_config_properties() -> BTreeMap<String, String> {
    // We don't specify other configs (such as controlled.shutdown.retry.backoff.ms and controlled.shutdown.max.retries),
    // as this way we can benefit from changing defaults in the future.
    BTreeMap::from([("controlled.shutdown.enable".to_string(), "true".to_string())])
}

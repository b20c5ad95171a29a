pub mod settings;

pub use settings::{
    CommandConfig, LinkConfig, ProvisioningConfig, RouterConfig, UploadConfig,
    CERT_FILE_NAME, DEFAULT_BAUD_RATE, KEY_FILE_NAME, MAX_RETRIES, MQTT_TLS_PORT, REMOTE_DIR,
};

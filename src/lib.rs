pub mod cleanup;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use cleanup::{
    clean_table, decide_provider_tls, CleanupConfig, CleanupEngine, CleanupSettings,
    CleanupSummary, HttpTlsProber, ProviderTlsSupport, TlsProbe,
};

use carewatch_core::types::SiteId;
use carewatch_upstream::UpstreamError;
use thiserror::Error;

/// Failures surfaced by the site registry to the connection manager.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The upstream watch for a newly watched site could not be established.
    /// The site entry has already been rolled back.
    #[error("failed to watch site {site_id}: {source}")]
    Watch {
        site_id: SiteId,
        #[source]
        source: UpstreamError,
    },
}

mod cancel;
pub mod directory;
mod discoverer;
mod http;
pub mod nameservers;
mod prober;
pub mod psl;
pub mod query;
pub mod sources;
mod types;
mod udp;
pub mod zone;

pub use cancel::CancellationToken;
pub use directory::{Directory, DirectoryError, TldRecord};
pub use discoverer::{Discoverer, DiscoveryError};
pub use http::create_http_client;
pub use nameservers::{NameserverDiscovery, NameserverError};
pub use prober::Prober;
pub use query::{DnsTransport, QueryError, DEFAULT_TIMEOUT};
pub use types::{
    DiscoverConfig, DiscoveryResult, NameserverConfig, ProbeOutcome, ProbeResult, DEFAULT_CHUNK_SIZE,
};
pub use udp::UdpTransport;

/// Looks up every name under every TLD of `directory` with default settings.
pub async fn discover(directory: Directory, names: &[String]) -> Result<DiscoveryResult, DiscoveryError> {
    Discoverer::new(directory)
        .discover(names, DEFAULT_CHUNK_SIZE)
        .await
}

/// Finds nameserver addresses for `tlds` using the parents known to
/// `directory`. The result is meant to be merged back into it.
pub async fn generate_tld_to_nameserver_ips(
    directory: Directory,
    tlds: &[String],
) -> Result<Directory, DiscoveryError> {
    NameserverDiscovery::new(directory)
        .generate_tld_to_nameserver_ips(tlds)
        .await
}

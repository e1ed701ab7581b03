use std::{collections::HashMap, net::SocketAddr};

use reqwest::Identity;
use tracing::instrument;

use crate::DnsOverrides;

/// Builds the pooled client shared by every request executor of a store.
#[instrument(level = "debug", name = "Build Http Client", skip(client_identity))]
pub(crate) fn build_http_client(
    client_identity: Option<Identity>,
    dns_overrides: Option<&DnsOverrides>,
    proxy_address: Option<&str>,
) -> anyhow::Result<reqwest::Client> {
    let mut client = reqwest::Client::builder();

    if let Some(identity) = client_identity {
        client = client.identity(identity).use_rustls_tls();
    }

    // Convert Option<HashMap<String, IpAddr>> into HashMap<String,SocketAddr>
    let overrides = dns_overrides
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, SocketAddr::new(v, 0)))
        .collect::<HashMap<String, SocketAddr>>();

    for (domain, address) in overrides {
        tracing::trace!("Adding `{}->{}` to dns overrides.", domain, address);
        client = client.resolve(domain.as_str(), address);
    }

    if let Some(proxy) = proxy_address {
        tracing::trace!("Proxy set to `{}`", proxy);
        client = client.proxy(reqwest::Proxy::all(proxy)?);
    } else {
        tracing::trace!("No proxy defined. Using system settings.");
    }

    Ok(client.build()?)
}

//! Install-time population of the shell partition.

use futures::future::try_join_all;
use offline_net::{Destination, Fetcher, Request, Response};
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::registry::{CacheRegistry, PartitionRole};
use crate::{Result, ServiceWorkerError};

/// Fetch every manifest entry and commit them to the shell partition.
///
/// All-or-nothing: a single failed fetch or non-ok status aborts before
/// anything is written, and the batch write itself is atomic. Returns the
/// number of entries committed.
pub async fn precache_shell(
    registry: &CacheRegistry,
    fetcher: &dyn Fetcher,
    config: &WorkerConfig,
) -> Result<usize> {
    let requests = config
        .precache
        .iter()
        .map(|path| {
            let url = config.resolve(path)?;
            let destination = Destination::guess_from_url(&url);
            Ok(Request::get(url).destination(destination))
        })
        .collect::<Result<Vec<_>>>()?;

    let pairs = try_join_all(requests.into_iter().map(|request| fetch_ok(fetcher, request))).await?;

    registry.store_all(PartitionRole::Shell, &pairs).await?;

    info!(
        partition = %registry.partition_name(PartitionRole::Shell),
        entries = pairs.len(),
        "Precached app shell"
    );
    Ok(pairs.len())
}

async fn fetch_ok(fetcher: &dyn Fetcher, request: Request) -> Result<(Request, Response)> {
    let response = fetcher.fetch(&request).await.map_err(|e| {
        ServiceWorkerError::InstallFetchFailure {
            url: request.url.to_string(),
            reason: e.to_string(),
        }
    })?;

    if !response.ok() {
        return Err(ServiceWorkerError::InstallFetchFailure {
            url: request.url.to_string(),
            reason: format!("status {}", response.status),
        });
    }

    debug!(url = %request.url, bytes = response.body.len(), "Fetched precache entry");
    Ok((request, response))
}

/*!
ravendb_http is the network layer of a client library for the RavenDB document database.

It turns commands into HTTP requests against a RavenDB cluster, picks which node serves each
request, fails over to the other nodes when one misbehaves and keeps the cluster topology up to
date in the background. Responses are cached per request URL and revalidated with the server's
change vectors, or served straight from memory when aggressive caching is turned on and a
change feed keeps the cache honest.

A single [`RequestExecutor`] exists per database and is shared by every caller working against
that database. The [`DocumentStore`] owns those executors and hands them out.

# Example
```rust,no_run
# tokio_test::block_on(async {
use ravendb_http::{commands::GetDocumentsCommand, DocumentStoreBuilder};

let document_store = DocumentStoreBuilder::new()
    .set_urls(&["http://localhost:8080"])
    .set_database_name("Northwind")
    .build()?;

let executor = document_store.get_request_executor(None).await?;
let mut command = GetDocumentsCommand::by_id("employees/1-A");
executor.execute(&mut command).await?;
println!("{:?}", command.result());

document_store.close().await;
# Ok::<(), anyhow::Error>(())
# });
```
*/

mod document_conventions;
mod document_store;
mod http_client;
mod request_executor;

pub mod changes;
pub mod commands;
pub mod events;
pub mod http_cache;
pub mod node_selector;
pub mod raven_command;
pub mod ravendb_error;
pub mod server_node;
pub mod topology;

pub use document_conventions::*;
pub use document_store::*;
pub use request_executor::*;

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}

//! Watch a directory tree and print every change event.
//!
//! ```bash
//! cargo run --example watch_demo -- /tmp/some/dir
//! ```

use std::sync::Arc;

use anyhow::Result;
use hostmon_file_events::{ChannelSink, FileEventPublisher, FilePathsConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let dir = std::env::args().nth(1).unwrap_or_else(|| ".".to_string());

    let (sink, mut events) = ChannelSink::new();
    let publisher = Arc::new(FileEventPublisher::new(Arc::new(sink)));

    let config = FilePathsConfig::default().watch("demo", format!("{dir}/**"));
    for outcome in publisher.configure(&config) {
        println!(
            "{} -> {} directorie(s)",
            outcome.pattern,
            outcome.directories.len()
        );
    }

    let run_loop = {
        let publisher = Arc::clone(&publisher);
        let token = publisher.shutdown_token();
        tokio::spawn(async move {
            while !token.is_cancelled() {
                publisher.run().await;
            }
        })
    };

    println!("watching {dir}, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => println!("{:<10} {}", event.action.to_string(), event.path.display()),
                None => break,
            },
        }
    }

    publisher.tear_down().await;
    run_loop.await?;
    Ok(())
}

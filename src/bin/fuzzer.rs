// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Drives random concurrent authors through the full in-memory stack and
//! checks that the server kept its promises: the log replays to exactly
//! the final content, and revisions are contiguous.

use anyhow::Result;
use clap::Parser;
use futures::future::join_all;
use rand::Rng;
use revisync::config::ServerConfig;
use revisync::document::BucketInfo;
use revisync::logging;
use revisync::ot::TextOperation;
use revisync::server::{DocServer, ServerError};
use revisync::store::{Persistence, RelationalStore};
use tokio::time::{sleep, Duration};
use tracing::info;

#[derive(Parser)]
struct Args {
    /// Number of documents edited concurrently.
    #[arg(long, default_value_t = 3)]
    documents: usize,
    /// Number of concurrent authors per document.
    #[arg(long, default_value_t = 4)]
    authors: usize,
    /// Number of operations each author submits.
    #[arg(long, default_value_t = 200)]
    operations: usize,
    #[arg(long)]
    debug: bool,
}

fn random_operation(content: &str) -> TextOperation {
    let mut rng = rand::thread_rng();
    let length = content.chars().count();
    let position = rng.gen_range(0..=length);
    let mut operation = TextOperation::default();
    operation.retain(position);

    if rng.gen_bool(0.7) || length == position {
        let glyphs = ["d", "ü", "🥕", "💚", "\n"];
        let text: String = (0..rng.gen_range(1..5))
            .map(|_| glyphs[rng.gen_range(0..glyphs.len())])
            .collect();
        operation.insert(&text);
        operation.retain(length - position);
    } else {
        let deletion = rng.gen_range(1..=(length - position).min(3));
        operation.delete(deletion);
        operation.retain(length - position - deletion);
    }
    operation
}

async fn run_author(
    server: DocServer,
    bucket_info: BucketInfo,
    file_path: String,
    author_id: String,
    operations: usize,
) {
    for _ in 0..operations {
        let state = server
            .get_or_create("fuzz", &file_path, bucket_info.clone())
            .await
            .expect("Failed to look up document");
        let operation = random_operation(&state.content);

        // By the time this arrives, other authors may have moved the
        // document on; that is the point.
        match server
            .receive_operation(&state.id, state.revision, operation, &author_id)
            .await
        {
            Ok(_) | Err(ServerError::LogGap { .. }) => {}
            Err(e) => panic!("Unexpected server error: {e}"),
        }

        let random_millis = rand::thread_rng().gen_range(0..5);
        sleep(Duration::from_millis(random_millis)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let args = Args::parse();
    logging::initialize(args.debug)?;

    let (persistence, store, blobs) = Persistence::in_memory();
    // Compaction stays off so the whole log remains replayable at the end.
    let config = ServerConfig {
        compact_interval: 0,
        ..ServerConfig::default()
    };
    let server = DocServer::new(persistence, config);
    let bucket_info = BucketInfo {
        bucket_name: "fuzz".into(),
        region: "local".into(),
    };

    let mut authors = vec![];
    for document in 0..args.documents {
        for author in 0..args.authors {
            authors.push(run_author(
                server.clone(),
                bucket_info.clone(),
                format!("file-{document}.txt"),
                format!("author-{author}"),
                args.operations,
            ));
        }
    }
    join_all(authors).await;
    server.save_all().await;

    for document in 0..args.documents {
        let file_path = format!("file-{document}.txt");
        let state = server
            .get_or_create("fuzz", &file_path, bucket_info.clone())
            .await?;

        // The log must replay to exactly the content the server ended on.
        let log = store.operations_since(&state.id, 0).await?;
        let mut replayed = String::new();
        for (index, entry) in log.iter().enumerate() {
            assert_eq!(
                entry.revision,
                index as u64 + 1,
                "Log of {file_path} has a gap"
            );
            replayed = TextOperation::from_json(&entry.operations)?.apply(&replayed)?;
        }
        assert_eq!(
            replayed, state.content,
            "Replaying the log of {file_path} diverged from the document"
        );
        assert_eq!(state.revision, log.len() as u64);

        // save_all flushed the blobs, too.
        assert_eq!(
            blobs.get("fuzz", &file_path).as_deref(),
            Some(state.content.as_str()),
            "Blob of {file_path} is stale"
        );
        info!(
            "{file_path}: {} revisions, {} characters, log replay matches.",
            state.revision,
            state.content.chars().count()
        );
    }

    println!("SUCCESS! 🥳");
    Ok(())
}

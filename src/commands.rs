use crate::cli::{CacheCommand, GateArgs};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::{StreamExt, TryStreamExt};
use mirage_config::Config;
use mirage_policy::{Footprint, Peer, Verdict};
use mirage_storage::{CompactEvent, Compaction, Compactor, ContentCache};
use std::pin::pin;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub entries: usize,
    pub size: u64,
    pub compacted: usize,
}

pub async fn cache(command: CacheCommand, config: &Config) -> Result<()> {
    let cache = ContentCache::open(&config.cache.directory).await.or_raise(|| ErrorKind::Cache)?;
    let cache = Arc::new(cache);
    match command {
        CacheCommand::Stats => {
            let stats = stats(&cache).await?;
            println!("root:      {}", cache.root().display());
            println!("entries:   {}", stats.entries);
            println!("size:      {} bytes", stats.size);
            println!("compacted: {}", stats.compacted);
        },
        CacheCommand::Verify => {
            let verification = cache.verify_all().await.or_raise(|| ErrorKind::Cache)?;
            println!("checked {} entries", verification.checked);
            for hash in &verification.corrupt {
                println!("removed corrupt entry {hash}");
            }
            if !verification.is_healthy() {
                exn::bail!(ErrorKind::Corrupt { corrupt: verification.corrupt.len() });
            }
        },
        CacheCommand::Compact => compact(cache, config).await?,
        CacheCommand::Evict { max_size } => match max_size.or(config.cache.max_size) {
            Some(limit) => {
                let eviction = cache.evict_to(limit).await.or_raise(|| ErrorKind::Cache)?;
                println!(
                    "removed {} entries, freed {} bytes, {} bytes remain",
                    eviction.removed, eviction.freed, eviction.remaining
                );
            },
            None => println!("no size limit configured; nothing to evict"),
        },
    }
    Ok(())
}

pub async fn stats(cache: &ContentCache) -> Result<Stats> {
    cache
        .enumerate()
        .try_fold(Stats::default(), |mut stats, entry| async move {
            stats.entries += 1;
            stats.size += entry.size;
            stats.compacted += usize::from(entry.is_compacted());
            Ok::<_, mirage_storage::error::Error>(stats)
        })
        .await
        .or_raise(|| ErrorKind::Cache)
}

async fn compact(cache: Arc<ContentCache>, config: &Config) -> Result<()> {
    let compactor = Compactor::new(cache, config.cache.compaction)
        .with_level(config.cache.level)
        .with_min_size(config.cache.compaction_min_size);
    let mut events = pin!(compactor.compact_all());
    let (mut compacted, mut skipped, mut failed, mut saved) = (0usize, 0usize, 0usize, 0u64);
    while let Some(event) = events.next().await {
        match event {
            Ok(CompactEvent::DiscoveryComplete(candidates)) => {
                tracing::info!(candidates, format = %compactor.format(), "Compacting cache");
            },
            Ok(CompactEvent::Processed(hash, Compaction::Compacted { before, after })) => {
                tracing::debug!(%hash, before, after, "Compacted");
                compacted += 1;
                saved += before.saturating_sub(after);
            },
            Ok(CompactEvent::Processed(hash, Compaction::Skipped(reason))) => {
                tracing::trace!(%hash, ?reason, "Skipped");
                skipped += 1;
            },
            Ok(CompactEvent::Started | CompactEvent::Complete) => {},
            Err(err) => {
                tracing::warn!(error = ?err, "Compaction failed");
                failed += 1;
            },
        }
    }
    println!("compacted {compacted} entries ({saved} bytes saved), skipped {skipped}");
    if failed > 0 {
        exn::bail!(ErrorKind::Compaction { failed });
    }
    Ok(())
}

pub fn gate(args: GateArgs, config: &Config) -> Verdict {
    let mut peer = Peer::new(args.peer);
    if args.direct {
        peer = peer.directly_paired();
    }
    let footprint = Footprint {
        vram_mib: args.vram,
        triangles: args.triangles,
        height: args.height,
        baseline_height: args.baseline,
    };
    mirage_policy::evaluate(&peer, &footprint, &config.performance)
}

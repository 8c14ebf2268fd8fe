//! Background pagination worker.
//!
//! The trigger route processes only the first page inline. Deeper pages are
//! queued here as continuation jobs and worked one step at a time, with the
//! watch's kill switch checked before every fetch.

use crate::db::Db;
use crate::error::IngestError;
use crate::maintenance;
use crate::pipeline;
use crate::twitter_api::{SearchProvider, SearchRequest};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};

/// Which half of the pipeline a continuation belongs to.
#[derive(Debug, Clone, Copy)]
pub enum Phase {
    NewRecords,
    Maintenance,
}

/// One pending pagination step.
#[derive(Debug)]
pub struct ContinuationJob {
    pub watch_name: String,
    /// The original request with the page's `next_token` swapped in.
    pub request: SearchRequest,
    /// Records handled so far in this run, including prior pages.
    pub cumulative: i64,
    pub phase: Phase,
}

/// Spawn the worker loop and hand back its job queue.
pub fn spawn_worker(db: Arc<Db>, provider: Arc<dyn SearchProvider>) -> UnboundedSender<ContinuationJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ContinuationJob>();
    let loop_tx = tx.clone();

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let name = job.watch_name.clone();
            if let Err(e) = continuation_step(&db, provider.as_ref(), &loop_tx, job).await {
                log::error!("[WATCH_INGEST] Continuation for {name} failed: {e}");
                if let Err(e) = db.set_watch_active(&name, false, Some("continuation failed")) {
                    log::error!("[WATCH_INGEST] Could not deactivate {name}: {e}");
                }
            }
        }
    });

    tx
}

/// Process one continuation: fetch the next page, handle it per phase, then
/// either enqueue the following page or finalize the run.
pub async fn continuation_step(
    db: &Db,
    provider: &dyn SearchProvider,
    jobs: &UnboundedSender<ContinuationJob>,
    job: ContinuationJob,
) -> Result<(), IngestError> {
    let watch = db
        .get_watch(&job.watch_name)?
        .ok_or_else(|| IngestError::UnknownWatch(job.watch_name.clone()))?;

    if watch.kill_switch {
        log::info!("[WATCH_INGEST] Download for {} stopped by request", watch.name);
        db.set_watch_active(&watch.name, false, Some("download killed"))?;
        return Ok(());
    }

    let (mut resp, _ratelimit) = provider.search(&job.request).await?;
    let next_token = resp.meta.next_token.clone();

    let count = match job.phase {
        Phase::NewRecords => {
            pipeline::process_new_page(db, provider, &watch.name, &mut resp).await?
        }
        Phase::Maintenance => maintenance::refresh_page(db, &watch.name, &mut resp)?,
    };
    let cumulative = job.cumulative + count;

    if pipeline::should_continue(next_token.as_deref(), watch.max_results, cumulative) {
        let _ = jobs.send(ContinuationJob {
            watch_name: job.watch_name,
            request: SearchRequest {
                next_token,
                ..job.request
            },
            cumulative,
            phase: job.phase,
        });
    } else {
        db.mark_pull_finished(&watch.name, cumulative)?;
    }

    Ok(())
}

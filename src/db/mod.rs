//! SQLite persistence for the outbox. One thread owns the connection and
//! callers hand it closures.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

mod helpers;
mod migrations;
mod repositories;

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Target {
    File(PathBuf),
    Memory,
}

impl Target {
    fn connect(&self) -> Result<Connection> {
        let conn = match self {
            Target::File(path) => Connection::open(path)
                .with_context(|| format!("failed to open outbox at {}", path.display()))?,
            Target::Memory => {
                Connection::open_in_memory().context("failed to open in-memory outbox")?
            }
        };
        if let Target::File(_) = self {
            if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                warn!("Outbox stays in rollback journal mode: {err}");
            }
        }
        Ok(conn)
    }
}

/// The connection thread. Dropping it closes the job channel, which ends the
/// thread's receive loop, then waits for the thread to exit.
struct Worker {
    jobs: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn start(target: Target) -> Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

        let thread = thread::Builder::new()
            .name("focus-sync-db".into())
            .spawn(move || {
                let mut conn = match target.connect() {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let migrated = migrations::run_migrations(&mut conn);
                let healthy = migrated.is_ok();
                let _ = ready_tx.send(migrated);
                if !healthy {
                    return;
                }

                for job in jobs_rx {
                    job(&mut conn);
                }
                info!("Outbox thread exiting");
            })
            .context("failed to spawn outbox thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("outbox thread died during startup"))??;

        Ok(Self {
            jobs: Some(jobs_tx),
            thread: Some(thread),
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| anyhow!("outbox thread is stopping"))?
            .send(job)
            .map_err(|_| anyhow!("outbox thread is gone"))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Outbox thread panicked");
            }
        }
    }
}

/// Cloneable handle to the outbox database.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    path: Option<Arc<PathBuf>>,
}

impl Database {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let worker = Worker::start(Target::File(path.clone()))?;
        info!("Outbox database ready at {}", path.display());
        Ok(Self {
            worker: Arc::new(worker),
            path: Some(Arc::new(path)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            worker: Arc::new(Worker::start(Target::Memory)?),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    /// Run `task` against the connection. The job is handed to the thread
    /// before this returns, so jobs run in call order even when their futures
    /// are awaited out of order.
    pub fn execute<F, T>(&self, task: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let submitted = self.worker.submit(Box::new(move |conn| {
            let _ = reply_tx.send(task(conn));
        }));

        async move {
            submitted?;
            reply_rx
                .await
                .map_err(|_| anyhow!("outbox job was dropped before it finished"))?
        }
    }
}

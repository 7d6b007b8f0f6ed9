use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use oj::config::{CliArgs, Command};
use oj::database::{self as db, SqliteStore};
use oj::executor::{Executor, Languages};
use oj::judge::Judge;
use oj::problem::ConfigProblems;
use oj::queue::TaskQueue;
use oj::sandbox::IsolateSandbox;
use oj::storage::LocalStorage;
use oj::submission::NewSubmission;
use oj::worker::Dispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let slot_count = cli.slot_count();
    if slot_count == 0 {
        bail!("The number of slots must not be 0");
    }

    // SAFETY: geteuid has no preconditions and cannot fail
    if unsafe { libc::geteuid() } != 0 {
        log::warn!("Not running as root, isolate may refuse to create boxes");
    }

    let config = cli.to_config().context("Failed to load configuration")?;
    let db_path = config.database.path()?;
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let store = Arc::new(
        SqliteStore::open(&db_path)
            .await
            .context("Failed to initialize database")?,
    );
    let storage = Arc::new(LocalStorage::new(config.storage.root()?)?);
    let problems = Arc::new(ConfigProblems::load(&config.problems, storage.as_ref()).await?);
    let languages = Arc::new(Languages::new(config.languages.clone()));
    let isolation = Arc::new(IsolateSandbox::build(&config.isolate)?);
    let queue = Arc::new(TaskQueue::new());

    let judge = Arc::new(Judge::new(
        store,
        problems,
        languages.clone(),
        queue.clone(),
    ));
    let executor = Arc::new(Executor::new(isolation, storage, languages));
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    judge.recover().await?;
    let dispatcher = Dispatcher::start(judge.clone(), executor, queue, slot_count).await;
    let mut dispatcher_task = tokio::spawn(dispatcher.run(shutdown_token.clone()));

    match cli.command {
        Command::Serve => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Ctrl-c received, shutting down...");
                }
                res = &mut dispatcher_task => {
                    log::error!("Dispatcher terminated unexpectedly: {res:?}");
                    return Ok(());
                }
            }
        }
        Command::Submit {
            problem,
            domain,
            language,
            source,
            user,
        } => {
            let source = std::fs::read_to_string(&source)
                .with_context(|| format!("Failed to read {}", source.display()))?;

            let mut finished = judge.subscribe();
            let submission = judge
                .submit(NewSubmission {
                    language,
                    source,
                    problem_id: problem,
                    domain_id: domain,
                    user_id: user,
                    contest_id: None,
                    team_id: None,
                })
                .await?;

            let outcome = loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break None,
                    msg = finished.recv() => match msg {
                        Ok(done) if done.id == submission.id => break Some(done),
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {
                            let current = judge.read(submission.id).await?;
                            if current.is_terminal() {
                                break Some(current);
                            }
                        }
                        Err(RecvError::Closed) => break None,
                    }
                }
            };

            match outcome {
                Some(done) => println!("{}", serde_json::to_string_pretty(&done)?),
                None => log::warn!("Submission {} did not finish", submission.id),
            }
        }
    }

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    shutdown_token.cancel();
    if let Err(e) = dispatcher_task.await {
        log::error!("Dispatcher handle finished with error: {e:?}");
    }

    log::info!("Shutdown complete");
    Ok(())
}

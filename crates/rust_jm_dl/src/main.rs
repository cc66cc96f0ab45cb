use rust_jm_dl::config::load_config;
use rust_jm_dl::errors::TargetKind;
use rust_jm_dl::logging::init_logging;
use rust_jm_dl::pipeline::{Deliver, Delivery, Pipeline};
use rust_jm_dl::queue::{JobPayload, JobQueue, JobStatus};

use std::path::PathBuf;
use std::sync::Arc;

use console::style;
use dialoguer::{Input, Select};
use futures::FutureExt;
use itertools::Itertools;
use miette::{IntoDiagnostic, Result};

const ACTIONS: [&str; 7] = [
    "Download album",
    "Download chapter",
    "Download blog",
    "Album info",
    "Search",
    "Queue status",
    "Quit",
];

fn prompt_id(what: &str) -> Result<u64> {
    Input::<u64>::new()
        .with_prompt(format!("{what} id"))
        .interact_text()
        .into_diagnostic()
}

/// Copies delivered files out of the work directory, which may get cleaned up.
fn deliver_to(out_dir: PathBuf) -> Deliver {
    Arc::new(move |payload: JobPayload, delivery: Delivery| {
        let out_dir = out_dir.clone();

        async move {
            tokio::fs::create_dir_all(&out_dir).await?;

            for file in &delivery.files {
                let Some(name) = file.file_name() else { continue };
                let target = out_dir.join(name);
                tokio::fs::copy(file, &target).await?;

                println!(
                    "\n{} {} {} -> {}",
                    style("done").green().bold(),
                    payload.kind,
                    delivery.target_id,
                    style(target.display()).cyan()
                );
            }
            Ok(())
        }
        .boxed()
    })
}

fn submit(queue: &JobQueue, kind: TargetKind, id: u64) {
    let added = queue.add(JobPayload::new(kind, id.to_string(), "cli"));

    println!(
        "Queued {kind} {id} as {} (position {}, {} ahead)",
        style(added.job.id).dim(),
        added.queue_position,
        added.pending_ahead
    );
}

fn print_queue(queue: &JobQueue) {
    let jobs = queue.unfinished_jobs();
    if jobs.is_empty() {
        println!("Nothing queued.");
        return;
    }

    for job in jobs {
        let status = match job.status {
            JobStatus::Pending => style(job.status).yellow(),
            JobStatus::Processing => style(job.status).cyan(),
            JobStatus::Completed => style(job.status).green(),
            JobStatus::Failed => style(job.status).red(),
        };

        println!(
            "{} {:<7} {:<10} {status} {}",
            style(job.id).dim(),
            job.payload.kind,
            job.payload.target_id,
            job.error.unwrap_or_default()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();
    let cfg = load_config()?;
    init_logging(&cfg.logging)?;

    let out_dir = cfg.output.root.join("delivered");
    let job_permits = cfg.concurrency.job_permits;
    let pipeline = Arc::new(Pipeline::new(cfg)?);
    let queue = JobQueue::new(
        Arc::clone(&pipeline).into_processor(deliver_to(out_dir)),
        job_permits,
    );

    loop {
        let action = Select::new()
            .with_prompt("What would you like to do?")
            .default(0)
            .items(&ACTIONS[..])
            .interact()
            .into_diagnostic()?;

        match action {
            0 => submit(&queue, TargetKind::Album, prompt_id("Album")?),
            1 => submit(&queue, TargetKind::Chapter, prompt_id("Chapter")?),
            2 => submit(&queue, TargetKind::Blog, prompt_id("Blog")?),
            3 => {
                let id = prompt_id("Album")?;
                match pipeline.album_summary(id).await {
                    Ok(s) => {
                        println!("{} ({})", style(&s.name).bold(), s.id);
                        println!("  chapters:   {}", s.chapter_count);
                        println!("  authors:    {}", s.authors.iter().join(", "));
                        println!("  characters: {}", s.characters.iter().join(", "));
                        println!("  likes {} / views {}", s.likes, s.views);
                    }
                    Err(e) => println!("{}", style(e.user_message()).red()),
                }
            }
            4 => {
                let keyword: String = Input::new()
                    .with_prompt("Keyword")
                    .interact_text()
                    .into_diagnostic()?;

                match pipeline.api().search(&keyword, 1).await {
                    Ok(page) => {
                        println!("{} results", page.total);
                        for item in page.items {
                            println!("  {:<8} {} [{}]", item.id, item.name, item.author);
                        }
                    }
                    Err(e) => println!("{}", style(e.user_message()).red()),
                }
            }
            5 => print_queue(&queue),
            _ => break,
        }
    }

    println!("Waiting for queued jobs...");
    queue.wait_idle().await;

    Ok(())
}

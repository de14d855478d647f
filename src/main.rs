use anyhow::{bail, Context};
use std::sync::Arc;

use riptide_engine_docker::progress::ProgressEvent;
use riptide_engine_docker::{
    DockerEngine, EngineConfig, ExecOptions, Project, ProjectProgress, RunOptions, StartOptions,
};

const USAGE: &str = "Usage: riptide-engine <project.json> <operation> [arguments...]

Operations:
    start [service...]        Start services (all if none given)
    stop [service...]         Stop services (all if none given)
    status                    Show which services are running
    pull                      Pull the images of all services and commands
    cmd <command> [args...]   Run a command in the foreground
    exec <service> [cmd]      Open a shell (or run cmd) in a running service
    volumes                   List named volumes
    volume-create <name>
    volume-delete <name>
    volume-copy <from> <to>";

/// Print progress until every service has finished; true if all succeeded
async fn report(mut progress: ProjectProgress) -> bool {
    let mut all_ok = true;
    while let Some((service, event)) = progress.next().await {
        match event {
            ProgressEvent::Step(step) => match step.total {
                Some(total) => println!("[{}] {}/{} {}", service, step.current, total, step.text),
                None => println!("[{}] {}/? {}", service, step.current, step.text),
            },
            ProgressEvent::Succeeded => {}
            ProgressEvent::Failed(failure) => {
                all_ok = false;
                println!("[{}] {}", service, failure);
                if let Some(details) = failure.details {
                    println!("{}", details);
                }
            }
        }
    }
    all_ok
}

fn selected_services(project: &Project, names: &[String]) -> Vec<String> {
    if names.is_empty() {
        project.services.keys().cloned().collect()
    } else {
        names.to_vec()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    }
    let (project_path, operation, rest) = (&args[0], args[1].as_str(), &args[2..]);

    let document = std::fs::read_to_string(project_path)
        .with_context(|| format!("Failed to read project file {}", project_path))?;
    let project = Arc::new(
        Project::from_json(&document)
            .with_context(|| format!("Invalid project file {}", project_path))?,
    );

    let engine = DockerEngine::connect(EngineConfig::from_env())
        .await
        .context("Connection with Docker daemon failed")?;

    match operation {
        "start" => {
            let services = selected_services(&project, rest);
            let progress = engine
                .start_project(project.clone(), &services, StartOptions::default())
                .await?;
            if !report(progress).await {
                std::process::exit(1);
            }
        }
        "stop" => {
            let services = selected_services(&project, rest);
            if !report(engine.stop_project(&project, &services)).await {
                std::process::exit(1);
            }
        }
        "status" => {
            for (service, running) in engine.status(&project).await? {
                let address = match engine.address_for(&project, &service).await? {
                    Some((host, port)) => format!(" http://{}:{}", host, port),
                    None => String::new(),
                };
                let state = if running { "running" } else { "stopped" };
                println!("{:<20} {}{}", service, state, address);
            }
        }
        "pull" => {
            engine
                .pull_images(&project, |line| println!("{}", line))
                .await?;
        }
        "cmd" => {
            let Some((command, command_args)) = rest.split_first() else {
                bail!("cmd needs a command name");
            };
            let options = RunOptions {
                args: command_args.to_vec(),
                ..Default::default()
            };
            let outcome = engine.cmd(&project, command, &options).await?;
            std::process::exit(outcome.exit_code);
        }
        "exec" => {
            let Some((service, cmd)) = rest.split_first() else {
                bail!("exec needs a service name");
            };
            let cmd = (!cmd.is_empty()).then(|| cmd.join(" "));
            let code = engine
                .exec(&project, service, cmd.as_deref(), &ExecOptions::default())
                .await?;
            std::process::exit(code);
        }
        "volumes" => {
            for volume in engine.list_named_volumes().await? {
                println!("{}", volume);
            }
        }
        "volume-create" => match rest {
            [name] => engine.create_named_volume(name).await?,
            _ => bail!("volume-create needs exactly one volume name"),
        },
        "volume-delete" => match rest {
            [name] => engine.delete_named_volume(name).await?,
            _ => bail!("volume-delete needs exactly one volume name"),
        },
        "volume-copy" => match rest {
            [from, to] => engine.copy_named_volume(from, to).await?,
            _ => bail!("volume-copy needs a source and a target volume"),
        },
        other => {
            eprintln!("Unknown operation '{}'\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }

    Ok(())
}

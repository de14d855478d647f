use regex::Regex;
use rstest::*;
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

use riptide_engine_docker::command::DEFAULT_EXEC_SHELL;
use riptide_engine_docker::container::entrypoint::{
    EENV_GROUP, EENV_NO_STDOUT_REDIRECT, EENV_RUN_MAIN_CMD_AS_USER, EENV_USER,
};
use riptide_engine_docker::model::{CommandLine, ROLE_SRC};
use riptide_engine_docker::runtime::{ContainerStatus, RuntimeCall};
use riptide_engine_docker::{
    Command, ContainerSpec, DockerEngine, ExecOptions, InMemoryRuntime, LinkOutcome, Project,
    RunOptions, Service,
};

use test_utils::{engine, runtime_with_images, RecordingLauncher};

#[fixture]
fn runtime() -> Arc<InMemoryRuntime> {
    runtime_with_images()
}

#[fixture]
fn project() -> Project {
    let mut console = Command::new("console", "php");
    console.command = Some(CommandLine::Shell("bin/console".to_string()));
    let mut migrate = Command::new("migrate", "alpine");
    migrate.command = Some(CommandLine::Exec(vec!["sh".to_string(), "migrate.sh".to_string()]));

    let mut php = Service::new("php", "php");
    php.roles = vec![ROLE_SRC.to_string()];
    let mut www = Service::new("www", "nginx");
    www.port = Some(80);

    Project::new("shop")
        .with_service(php)
        .with_service(www)
        .with_command(console)
        .with_command(migrate)
}

fn flag_values<'a>(argv: &'a [String], name: &str) -> Vec<&'a str> {
    argv.windows(2)
        .filter(|pair| pair[0] == name)
        .map(|pair| pair[1].as_str())
        .collect()
}

fn with_launcher(runtime: &Arc<InMemoryRuntime>, launcher: &Arc<RecordingLauncher>) -> DockerEngine {
    engine(runtime.clone(), launcher.clone())
}

#[rstest]
#[tokio::test]
async fn test_cmd_runs_in_foreground(runtime: Arc<InMemoryRuntime>, project: Project) {
    let launcher = Arc::new(RecordingLauncher::creating_containers(runtime.clone(), 0));
    let engine = with_launcher(&runtime, &launcher);
    let options = RunOptions {
        args: vec!["cache:clear".to_string(), "--env=prod".to_string()],
        working_directory: Some("app".to_string()),
        ..Default::default()
    };

    let outcome = assert_ok!(engine.cmd(&project, "console", &options).await);
    assert_eq!(outcome.exit_code, 0);

    let launched = launcher.launched();
    assert_eq!(launched.len(), 1);
    let argv = &launched[0];
    assert_eq!(&argv[..4], &["docker", "run", "--rm", "-i"]);

    let name = Regex::new(r"^riptide__shop__cmd__console__\d+$").unwrap();
    let names = flag_values(argv, "--name");
    assert_eq!(names.len(), 1);
    assert!(name.is_match(names[0]), "{}", names[0]);

    assert_eq!(flag_values(argv, "--network"), vec!["riptide__shop"]);
    assert_eq!(flag_values(argv, "-w"), vec!["/src/app"]);
    let env = flag_values(argv, "-e");
    for expected in [
        format!("{}=yes", EENV_NO_STDOUT_REDIRECT),
        format!("{}=yes", EENV_RUN_MAIN_CMD_AS_USER),
        format!("{}=1000", EENV_USER),
        format!("{}=1000", EENV_GROUP),
    ] {
        assert!(env.contains(&expected.as_str()), "missing {}", expected);
    }
    assert_eq!(argv[argv.len() - 2], "php");
    assert_eq!(argv[argv.len() - 1], "bin/console \"cache:clear\" \"--env=prod\"");
}

#[rstest]
#[tokio::test]
async fn test_cmd_attaches_links_in_background(runtime: Arc<InMemoryRuntime>, project: Project) {
    runtime.add_network("riptide__payments");
    let mut project = project;
    project.links = vec!["payments".to_string(), "mail".to_string()];
    let launcher = Arc::new(RecordingLauncher::creating_containers(runtime.clone(), 3));

    let outcome = assert_ok!(
        with_launcher(&runtime, &launcher)
            .cmd(&project, "console", &RunOptions::default())
            .await
    );

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(
        outcome.links,
        LinkOutcome::Attached(vec!["riptide__payments".to_string()])
    );
    let connected = runtime
        .calls()
        .into_iter()
        .find_map(|call| match call {
            RuntimeCall::ConnectNetwork {
                network,
                container,
                aliases,
            } => Some((network, container, aliases)),
            _ => None,
        })
        .unwrap();
    assert_eq!(connected.0, "riptide__payments");
    assert!(connected.1.starts_with("riptide__shop__cmd__console__"));
    assert!(connected.2.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_cmd_pulls_missing_image(runtime: Arc<InMemoryRuntime>) {
    let project = Project::new("shop").with_command(Command::new("redis-cli", "redis"));
    let launcher = Arc::new(RecordingLauncher::new(0));

    assert_ok!(
        with_launcher(&runtime, &launcher)
            .cmd(&project, "redis-cli", &RunOptions::default())
            .await
    );

    assert!(runtime.has_image("redis"));
    // The image default command is used and rendered as nothing
    assert_eq!(launcher.launched()[0].last().unwrap(), "redis");
}

#[rstest]
#[tokio::test]
async fn test_unknown_command(runtime: Arc<InMemoryRuntime>, project: Project) {
    let launcher = Arc::new(RecordingLauncher::new(0));
    let engine = with_launcher(&runtime, &launcher);

    let err = assert_err!(engine.cmd(&project, "deploy", &RunOptions::default()).await);
    assert_eq!(err.to_string(), "Command not found.");
    let err = assert_err!(engine.cmd_detached(&project, "deploy", false).await);
    assert_eq!(err.to_string(), "Command not found.");
    assert!(launcher.launched().is_empty());
}

#[rstest]
#[case(false)]
#[case(true)]
#[tokio::test]
async fn test_cmd_detached(runtime: Arc<InMemoryRuntime>, project: Project, #[case] run_as_root: bool) {
    let seen: Arc<Mutex<Vec<ContainerSpec>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    runtime.exit_when(
        move |spec| {
            sink.lock().unwrap().push(spec.clone());
            spec.image == "alpine"
        },
        3,
        "Applying migrations\nFailed at step 2",
    );
    let launcher = Arc::new(RecordingLauncher::new(0));

    let (code, output) = assert_ok!(
        with_launcher(&runtime, &launcher)
            .cmd_detached(&project, "migrate", run_as_root)
            .await
    );

    assert_eq!(code, 3);
    assert_eq!(output, "Applying migrations\nFailed at step 2");
    assert!(runtime.container_names().is_empty());
    assert!(launcher.launched().is_empty());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let spec = &seen[0];
    assert!(Regex::new(r"^riptide__shop__detached_cmd__\d+$")
        .unwrap()
        .is_match(spec.name.as_deref().unwrap()));
    assert_eq!(spec.network.as_deref(), Some("riptide__shop"));
    assert_eq!(spec.environment[EENV_NO_STDOUT_REDIRECT], "yes");
    assert_eq!(
        spec.environment.get(EENV_RUN_MAIN_CMD_AS_USER).is_some(),
        !run_as_root
    );
}

#[rstest]
#[tokio::test]
async fn test_exec_opens_shell(runtime: Arc<InMemoryRuntime>, project: Project) {
    runtime.insert_container("riptide__shop__php", ContainerStatus::Running, Default::default());
    let launcher = Arc::new(RecordingLauncher::new(130));
    let options = ExecOptions {
        cols: Some(200),
        lines: Some(50),
        ..Default::default()
    };

    let code = assert_ok!(
        with_launcher(&runtime, &launcher)
            .exec(&project, "php", None, &options)
            .await
    );

    assert_eq!(code, 130);
    assert_eq!(
        launcher.launched()[0],
        vec![
            "docker",
            "exec",
            "-it",
            "-u",
            "1000:1000",
            "-e",
            "COLUMNS=200",
            "-e",
            "LINES=50",
            "-w",
            "/src",
            "riptide__shop__php",
            "sh",
            "-c",
            DEFAULT_EXEC_SHELL,
        ]
    );
}

#[rstest]
#[tokio::test]
async fn test_exec_requires_running_service(runtime: Arc<InMemoryRuntime>, project: Project) {
    let launcher = Arc::new(RecordingLauncher::new(0));
    let engine = with_launcher(&runtime, &launcher);

    let err = assert_err!(engine.exec(&project, "php", None, &ExecOptions::default()).await);
    assert_eq!(err.to_string(), "The service is not running. Try starting it first.");

    runtime.insert_container("riptide__shop__php", ContainerStatus::Exited, Default::default());
    let err = assert_err!(engine.exec(&project, "php", Some("ls"), &ExecOptions::default()).await);
    assert_eq!(err.to_string(), "The service is not running. Try starting it first.");
    // The exited container is cleaned up
    assert_eq!(runtime.container_status("riptide__shop__php"), None);

    let err = assert_err!(engine.exec(&project, "mail", None, &ExecOptions::default()).await);
    assert_eq!(err.to_string(), "Service not found.");
    assert!(launcher.launched().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_cmd_in_service(runtime: Arc<InMemoryRuntime>, project: Project) {
    runtime.insert_container("riptide__shop__php", ContainerStatus::Running, Default::default());
    let launcher = Arc::new(RecordingLauncher::new(0));
    let options = RunOptions {
        args: vec!["cache:clear".to_string()],
        ..Default::default()
    };

    assert_ok!(
        with_launcher(&runtime, &launcher)
            .cmd_in_service(&project, "console", "php", &options)
            .await
    );

    let argv = &launcher.launched()[0];
    assert_eq!(argv[argv.len() - 4], "riptide__shop__php");
    assert_eq!(argv[argv.len() - 1], "bin/console \"cache:clear\"");
}

#[rstest]
#[tokio::test]
async fn test_service_fg_publishes_main_port(runtime: Arc<InMemoryRuntime>, project: Project) {
    let launcher = Arc::new(RecordingLauncher::new(0));
    let engine = with_launcher(&runtime, &launcher);

    assert_ok!(engine.service_fg(&project, "www", &RunOptions::default()).await);

    let argv = &launcher.launched()[0];
    assert_eq!(flag_values(argv, "--name"), vec!["riptide__shop__www"]);
    assert_eq!(flag_values(argv, "-p"), vec!["30000:80"]);
    assert!(flag_values(argv, "--label").contains(&"riptide_port=30000"));
    assert!(flag_values(argv, "--label").contains(&"riptide_service=www"));

    let err = assert_err!(engine.service_fg(&project, "mail", &RunOptions::default()).await);
    assert_eq!(err.to_string(), "Service not found.");
}

//! Environment contract of the injected entrypoint script
//!
//! The script replaces the image entrypoint, prepares the container (user,
//! volume ownership, overlays, host names) and then re-executes the original
//! entrypoint and command. Everything it needs is passed as environment
//! variables named here.

use indexmap::IndexMap;

use crate::model::{EntrypointDeclaration, ImageConfig, Service};

pub const EENV_DONT_RUN_CMD: &str = "RIPTIDE__DOCKER_DONT_RUN_CMD";
pub const EENV_USER: &str = "RIPTIDE__DOCKER_USER";
pub const EENV_USER_RUN: &str = "RIPTIDE__DOCKER_USER_RUN";
pub const EENV_GROUP: &str = "RIPTIDE__DOCKER_GROUP";
pub const EENV_RUN_MAIN_CMD_AS_USER: &str = "RIPTIDE__DOCKER_RUN_MAIN_CMD_AS_USER";
pub const EENV_ORIGINAL_ENTRYPOINT: &str = "RIPTIDE__DOCKER_ORIGINAL_ENTRYPOINT";
pub const EENV_COMMAND_LOG_PREFIX: &str = "RIPTIDE__DOCKER_CMD_LOGGING_";
pub const EENV_NO_STDOUT_REDIRECT: &str = "RIPTIDE__DOCKER_NO_STDOUT_REDIRECT";
pub const EENV_NAMED_VOLUMES: &str = "RIPTIDE__DOCKER_NAMED_VOLUMES";
pub const EENV_ON_LINUX: &str = "RIPTIDE__DOCKER_ON_LINUX";
pub const EENV_HOST_SYSTEM_HOSTNAMES: &str = "RIPTIDE__DOCKER_HOST_SYSTEM_HOSTNAMES";
pub const EENV_OVERLAY_TARGETS: &str = "RIPTIDE__DOCKER_OVERLAY_TARGETS";

/// Wrap a word in double quotes
pub fn quote(word: &str) -> String {
    format!("\"{}\"", word)
}

/// Join words, each wrapped in double quotes
pub fn quote_all<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Encode the original entrypoint of an image for the entrypoint script.
///
/// Exec form becomes one string with every argument quoted; the command still
/// runs after it. Shell form becomes `/bin/sh -c <string>` and the command is
/// not run, matching how the daemon treats shell-form entrypoints.
pub fn encode_entrypoint(entrypoint: Option<&EntrypointDeclaration>) -> IndexMap<String, String> {
    let mut env = IndexMap::new();
    match entrypoint {
        Some(EntrypointDeclaration::Exec(parts)) if !parts.is_empty() => {
            let (command, arguments) = parts.split_at(1);
            let encoded = if arguments.is_empty() {
                command[0].clone()
            } else {
                format!("{} {}", command[0], quote_all(arguments))
            };
            env.insert(EENV_ORIGINAL_ENTRYPOINT.to_string(), encoded);
        }
        Some(EntrypointDeclaration::Shell(line)) if !line.is_empty() => {
            env.insert(
                EENV_ORIGINAL_ENTRYPOINT.to_string(),
                format!("/bin/sh -c {}", line),
            );
            env.insert(EENV_DONT_RUN_CMD.to_string(), "true".to_string());
        }
        _ => {
            env.insert(EENV_ORIGINAL_ENTRYPOINT.to_string(), String::new());
        }
    }
    env
}

/// Numeric identity of the user running the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostUser {
    pub uid: u32,
    pub gid: u32,
}

impl HostUser {
    #[cfg(unix)]
    pub fn current() -> Self {
        // SAFETY: getuid/getgid cannot fail and have no preconditions
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self { uid, gid }
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// Environment telling the entrypoint which user to create and run the main command as
pub fn entrypoint_user_settings(
    service: &Service,
    user: HostUser,
    image_config: &ImageConfig,
) -> IndexMap<String, String> {
    let mut env = IndexMap::new();

    if !service.dont_create_user {
        env.insert(EENV_USER.to_string(), user.uid.to_string());
        env.insert(EENV_GROUP.to_string(), user.gid.to_string());
    }

    let image_user = image_config.user.as_deref().unwrap_or("");
    if service.run_as_current_user {
        env.insert(EENV_RUN_MAIN_CMD_AS_USER.to_string(), "yes".to_string());
    } else if !image_user.is_empty() {
        env.insert(EENV_RUN_MAIN_CMD_AS_USER.to_string(), "yes".to_string());
        env.insert(EENV_USER_RUN.to_string(), image_user.to_string());
    }

    env
}

/// One variable per logging command, sorted by command name
pub fn logging_command_settings(service: &Service) -> IndexMap<String, String> {
    let mut names: Vec<&String> = service.logging_commands.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            (
                format!("{}{}", EENV_COMMAND_LOG_PREFIX, name),
                service.logging_commands[name].clone(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(parts: &[&str]) -> EntrypointDeclaration {
        EntrypointDeclaration::Exec(parts.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_encode_no_entrypoint() {
        let env = encode_entrypoint(None);
        assert_eq!(env[EENV_ORIGINAL_ENTRYPOINT], "");
        assert!(!env.contains_key(EENV_DONT_RUN_CMD));

        let env = encode_entrypoint(Some(&exec(&[])));
        assert_eq!(env[EENV_ORIGINAL_ENTRYPOINT], "");
        assert!(!env.contains_key(EENV_DONT_RUN_CMD));
    }

    #[test]
    fn test_encode_exec_form() {
        let env = encode_entrypoint(Some(&exec(&["cmd", "a", "b c"])));
        assert_eq!(env[EENV_ORIGINAL_ENTRYPOINT], "cmd \"a\" \"b c\"");
        assert!(!env.contains_key(EENV_DONT_RUN_CMD));

        let env = encode_entrypoint(Some(&exec(&["docker-entrypoint.sh"])));
        assert_eq!(env[EENV_ORIGINAL_ENTRYPOINT], "docker-entrypoint.sh");
    }

    #[test]
    fn test_encode_shell_form() {
        let env = encode_entrypoint(Some(&EntrypointDeclaration::Shell(
            "sh string".to_string(),
        )));
        assert_eq!(env[EENV_ORIGINAL_ENTRYPOINT], "/bin/sh -c sh string");
        assert_eq!(env[EENV_DONT_RUN_CMD], "true");
    }

    #[test]
    fn test_user_settings_current_user() {
        let service = Service::new("www", "nginx");
        let user = HostUser { uid: 9898, gid: 8989 };
        let env = entrypoint_user_settings(&service, user, &ImageConfig::default());

        assert_eq!(env[EENV_USER], "9898");
        assert_eq!(env[EENV_GROUP], "8989");
        assert_eq!(env[EENV_RUN_MAIN_CMD_AS_USER], "yes");
        assert!(!env.contains_key(EENV_USER_RUN));
    }

    #[test]
    fn test_user_settings_image_user() {
        let mut service = Service::new("db", "postgres");
        service.run_as_current_user = false;
        service.dont_create_user = true;
        let image = ImageConfig {
            user: Some("12345".to_string()),
            ..Default::default()
        };
        let env = entrypoint_user_settings(&service, HostUser { uid: 1, gid: 1 }, &image);

        assert!(!env.contains_key(EENV_USER));
        assert_eq!(env[EENV_RUN_MAIN_CMD_AS_USER], "yes");
        assert_eq!(env[EENV_USER_RUN], "12345");

        let env = entrypoint_user_settings(&service, HostUser { uid: 1, gid: 1 }, &ImageConfig::default());
        assert!(env.is_empty());
    }

    #[test]
    fn test_logging_commands_sorted() {
        let mut service = Service::new("www", "nginx");
        service
            .logging_commands
            .insert("zeta".to_string(), "tail -f z".to_string());
        service
            .logging_commands
            .insert("alpha".to_string(), "tail -f a".to_string());

        let env = logging_command_settings(&service);
        let keys: Vec<&String> = env.keys().collect();
        assert_eq!(
            keys,
            vec![
                "RIPTIDE__DOCKER_CMD_LOGGING_alpha",
                "RIPTIDE__DOCKER_CMD_LOGGING_zeta"
            ]
        );
    }
}

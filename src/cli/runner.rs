//! CLI runner functions

use std::sync::Arc;

use tracing::{info, warn};

use super::TargetArgs;
use crate::config::{Config, SessionOptions, validate_session_options};
use crate::error::{Result, SshError};
use crate::ports::Connector;
use crate::ssh::{
    ChannelParams, ExecOptions, RetryConfig, Session, is_retryable_error, with_retry_if,
};

/// Work out the hostname and session options for `host`: a profile from
/// `config` if one has that alias, otherwise `host` itself. Flags given on
/// the command line override the profile.
///
/// # Errors
///
/// Returns [`SshError::Config`] if `--password-env` names an unset variable
/// and [`SshError::ConfigInvalid`] if the resulting options are invalid.
pub fn resolve_target(
    config: &Config,
    host: &str,
    target: &TargetArgs,
) -> Result<(String, SessionOptions)> {
    let (hostname, mut options) = config.hosts.get(host).map_or_else(
        || (host.to_string(), SessionOptions::default()),
        |profile| (profile.hostname.clone(), profile.session.clone()),
    );

    if let Some(user) = &target.user {
        options.user = Some(user.clone());
    }
    if let Some(port) = target.port {
        options.port = port;
    }
    if let Some(key) = &target.key {
        options.key = Some(key.clone());
    }
    if let Some(var) = &target.password_env {
        let password = std::env::var(var)
            .map_err(|_| SshError::Config(format!("environment variable {var} is not set")))?;
        options.password = Some(password.into());
    }

    validate_session_options(host, &options)?;
    Ok((hostname, options))
}

async fn connect(
    connector: Arc<dyn Connector>,
    hostname: &str,
    options: SessionOptions,
) -> Result<Session> {
    with_retry_if(
        &RetryConfig::default(),
        "connect",
        || Session::from_options(Arc::clone(&connector), Some(hostname), options.clone()),
        is_retryable_error,
    )
    .await
}

/// Run `command` and print its output.
///
/// # Errors
///
/// Returns an error if the host cannot be resolved, reached or logged in to.
pub async fn run_exec(
    connector: Arc<dyn Connector>,
    config: &Config,
    host: &str,
    command: &str,
    opts: ExecOptions,
    target: &TargetArgs,
) -> Result<()> {
    let (hostname, options) = resolve_target(config, host, target)?;
    let mut session = connect(connector, &hostname, options).await?;

    info!(host = %hostname, command = %command, "Executing SSH command");
    let output = session.exec(command, opts).await;
    session.close().await;

    match output? {
        Some(output) if opts.chomp => println!("{output}"),
        Some(output) => print!("{output}"),
        None => {}
    }
    Ok(())
}

/// Run `command`, printing stdout to stdout and stderr to stderr. Returns
/// whether the command was started and exited with status 0.
///
/// # Errors
///
/// Returns an error if the host cannot be resolved, reached or logged in to.
pub async fn run_capture(
    connector: Arc<dyn Connector>,
    config: &Config,
    host: &str,
    command: &str,
    target: &TargetArgs,
) -> Result<bool> {
    let (hostname, options) = resolve_target(config, host, target)?;
    let mut session = connect(connector, &hostname, options).await?;

    let captured = async {
        let channel = session.open_channel(ChannelParams::default(), None).await?;
        let capture = channel.capture3(command, ExecOptions::default()).await?;
        Ok::<_, SshError>((capture, channel.exit_status()))
    }
    .await;
    session.close().await;
    let (capture, exit_status) = captured?;

    if let Some(stdout) = &capture.stdout {
        print!("{stdout}");
    }
    if let Some(stderr) = &capture.stderr {
        eprint!("{stderr}");
    }

    if !capture.success {
        warn!(host = %hostname, command = %command, "Command request rejected");
        return Ok(false);
    }
    if let Some(code) = exit_status.filter(|code| *code != 0) {
        warn!(host = %hostname, command = %command, exit_status = code, "Command failed");
        return Ok(false);
    }
    Ok(true)
}

/// Print the authentication methods offered for `login`, one per line.
///
/// # Errors
///
/// Returns an error if the host cannot be resolved or reached.
pub async fn run_auth_methods(
    connector: Arc<dyn Connector>,
    config: &Config,
    host: &str,
    login: &str,
    target: &TargetArgs,
) -> Result<Vec<String>> {
    let (hostname, mut options) = resolve_target(config, host, target)?;
    options.user = None;
    let mut session = connect(connector, &hostname, options).await?;

    let methods = session.userauth_methods(login).await;
    session.close().await;
    let methods = methods?;

    for method in &methods {
        println!("{method}");
    }
    Ok(methods)
}

/// Print the host key fingerprint.
///
/// # Errors
///
/// Returns an error if the host cannot be resolved or reached.
pub async fn run_fingerprint(
    connector: Arc<dyn Connector>,
    config: &Config,
    host: &str,
    target: &TargetArgs,
) -> Result<String> {
    let (hostname, mut options) = resolve_target(config, host, target)?;
    options.user = None;
    let mut session = connect(connector, &hostname, options).await?;

    let fingerprint = session.fingerprint().await;
    session.close().await;
    let fingerprint = fingerprint?;

    println!("{fingerprint}");
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostProfile;
    use crate::ports::mock::{MockCommand, MockConnector};
    use crate::runtime;
    use zeroize::Zeroizing;

    fn config() -> Config {
        let mut config = Config::default();
        config.hosts.insert(
            "build".to_string(),
            HostProfile {
                hostname: "build.example".to_string(),
                session: SessionOptions {
                    port: 2200,
                    user: Some("ci".to_string()),
                    password: Some(Zeroizing::new("secret".to_string())),
                    ..Default::default()
                },
                description: None,
            },
        );
        config
    }

    fn mock(connector: &MockConnector) -> Arc<dyn Connector> {
        runtime::startup();
        Arc::new(connector.clone())
    }

    #[test]
    fn test_resolve_profile() {
        let (hostname, options) =
            resolve_target(&config(), "build", &TargetArgs::default()).unwrap();
        assert_eq!(hostname, "build.example");
        assert_eq!(options.port, 2200);
        assert_eq!(options.user.as_deref(), Some("ci"));
    }

    #[test]
    fn test_resolve_profile_with_overrides() {
        let target = TargetArgs {
            user: Some("admin".to_string()),
            port: Some(22),
            ..Default::default()
        };
        let (_, options) = resolve_target(&config(), "build", &target).unwrap();
        assert_eq!(options.user.as_deref(), Some("admin"));
        assert_eq!(options.port, 22);
    }

    #[test]
    fn test_resolve_raw_host() {
        let (hostname, options) =
            resolve_target(&Config::default(), "10.0.0.5", &TargetArgs::default()).unwrap();
        assert_eq!(hostname, "10.0.0.5");
        assert_eq!(options.port, 22);
        assert!(options.user.is_none());
    }

    #[test]
    fn test_resolve_missing_password_env() {
        let target = TargetArgs {
            password_env: Some("SSHMUX_TEST_UNSET_PASSWORD_VARIABLE".to_string()),
            ..Default::default()
        };
        let result = resolve_target(&Config::default(), "10.0.0.5", &target);
        assert!(matches!(result, Err(SshError::Config(_))));
    }

    #[test]
    fn test_resolve_rejects_invalid_options() {
        let target = TargetArgs {
            port: Some(0),
            ..Default::default()
        };
        let result = resolve_target(&Config::default(), "10.0.0.5", &target);
        assert!(matches!(result, Err(SshError::ConfigInvalid { .. })));
    }

    #[tokio::test]
    async fn test_run_exec_logs_in_and_closes() {
        let connector =
            MockConnector::new().with_command("uptime", MockCommand::stdout("up 3 days\n"));
        run_exec(
            mock(&connector),
            &config(),
            "build",
            "uptime",
            ExecOptions::chomp(),
            &TargetArgs::default(),
        )
        .await
        .unwrap();

        let calls = connector.calls();
        assert_eq!(calls[0], "connect build.example:2200");
        assert_eq!(calls[1], "auth ci password");
        assert!(calls.iter().any(|c| c == "request 0 exec uptime"));
        assert_eq!(connector.count("disconnect"), 1);
    }

    #[tokio::test]
    async fn test_run_capture_reports_failure() {
        let connector = MockConnector::new()
            .with_command("make check", MockCommand::new("", "1 test failed\n", 2));
        let ok = run_capture(
            mock(&connector),
            &config(),
            "build",
            "make check",
            &TargetArgs::default(),
        )
        .await
        .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_run_capture_success() {
        let connector = MockConnector::new().with_command("true", MockCommand::default());
        let ok = run_capture(mock(&connector), &config(), "build", "true", &TargetArgs::default())
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_run_auth_methods_does_not_log_in() {
        let connector = MockConnector::new();
        let methods = run_auth_methods(
            mock(&connector),
            &config(),
            "build",
            "ci",
            &TargetArgs::default(),
        )
        .await
        .unwrap();
        assert_eq!(methods, vec!["publickey", "password"]);
        assert_eq!(connector.count("auth "), 0);
    }

    #[tokio::test]
    async fn test_run_fingerprint() {
        let connector = MockConnector::new();
        let fingerprint =
            run_fingerprint(mock(&connector), &config(), "build", &TargetArgs::default())
                .await
                .unwrap();
        assert!(fingerprint.starts_with("SHA256:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_refused_connections() {
        let connector = MockConnector::new().refusing_connections();
        let result = run_fingerprint(
            mock(&connector),
            &Config::default(),
            "10.0.0.5",
            &TargetArgs::default(),
        )
        .await;
        assert!(matches!(result, Err(SshError::Connect { .. })));
        assert_eq!(connector.count("connect"), 3);
    }
}

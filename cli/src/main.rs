use std::sync::Arc;

use authkit::{
    Access, AccessGuard, ConfigError, ErrorCode, FileCredentialStore, GuardOptions, HttpApiConfig, HttpSessionApi,
    LoginCredentials, QueueScheduler, RegisterData, SessionConfig, SessionError, SessionManager, SocialAuthOptions,
    Subject,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Api(#[from] authkit::ApiError),
    #[error("not signed in")]
    NotSignedIn,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl CliError {
    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "E_CONFIG",
            Self::Session(e) => e.error_code(),
            Self::Api(e) => e.error_code(),
            Self::NotSignedIn => "E_NOT_SIGNED_IN",
            Self::InvalidJson(_) => "E_JSON",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "authctl", about = "Sign in, inspect and gate an auth session from the shell")]
struct Cli {
    #[arg(long, env = "AUTHKIT_API_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "AUTHKIT_TOKEN_FILE", default_value = ".authkit-token")]
    token_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "AUTHKIT_PASSWORD")]
        password: String,
    },
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "AUTHKIT_PASSWORD")]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    Logout,
    Whoami,
    Refresh,
    SocialUrl {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        redirect_uri: Option<String>,
    },
    /// Resolve the session and run the access guard against it.
    Check {
        #[arg(long = "role")]
        roles: Vec<String>,
    },
}

/// Subject shape the CLI expects from `/auth/me`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct CliUser {
    id: String,
    email: String,
    #[serde(default)]
    roles: Vec<String>,
}

impl Subject for CliUser {
    fn id(&self) -> &str {
        &self.id
    }

    fn email(&self) -> &str {
        &self.email
    }
}

type Api = HttpSessionApi<CliUser>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        let rendered = json!({ "error": e.to_string(), "code": e.code() });
        eprintln!("{rendered}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let session = build_session(&cli)?;
    let routes = session.config().routes.clone();

    match cli.command {
        Command::Login { email, password } => {
            let user = session.login(&LoginCredentials::new(email, password)).await?;
            print_json(&json!({ "user": user, "next": routes.after_login }))
        }
        Command::Register { email, password, name } => {
            let user = session.register(&RegisterData { email, password, name }).await?;
            print_json(&json!({ "user": user, "next": routes.after_login }))
        }
        Command::Logout => {
            session.logout().await?;
            print_json(&json!({ "signed_out": true, "next": routes.after_logout }))
        }
        Command::Whoami => {
            let state = session.resolve().await;
            let user = state.subject.ok_or(CliError::NotSignedIn)?;
            print_json(&json!({ "user": user }))
        }
        Command::Refresh => {
            session.resolve().await;
            if !session.is_authenticated() {
                return Err(CliError::NotSignedIn);
            }
            session.refresh_token().await?;
            print_json(&json!({ "refreshed": true }))
        }
        Command::SocialUrl { provider, redirect_uri } => {
            let mut options = SocialAuthOptions::new(provider.as_str());
            if let Some(uri) = redirect_uri {
                options = options.with_redirect_uri(uri);
            }
            let url = session.social_auth_url(&options)?;
            print_json(&json!({ "provider": options.provider, "url": url }))
        }
        Command::Check { roles } => run_check(&session, roles, &routes.login).await,
    }
}

fn build_session(cli: &Cli) -> Result<SessionManager<Api>, CliError> {
    let mut api_config = match HttpApiConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(_)) => HttpApiConfig::new(cli.base_url.as_str()),
        Err(e) => return Err(e.into()),
    };
    api_config.base_url = cli.base_url.trim_end_matches('/').to_owned();
    tracing::debug!(base_url = %api_config.base_url, token_file = %cli.token_file, "session configured");

    let store = Arc::new(FileCredentialStore::new(&cli.token_file));
    let api = HttpSessionApi::new(api_config, store.clone())?;
    Ok(SessionManager::builder(api, store)
        .config(SessionConfig::from_env()?)
        .build())
}

async fn run_check(session: &SessionManager<Api>, roles: Vec<String>, login_route: &str) -> Result<(), CliError> {
    let state = session.resolve().await;
    let scheduler = Arc::new(QueueScheduler::new());
    let role_check: authkit::guard::RoleCheck<CliUser> =
        Arc::new(|user: &CliUser, role: &str| user.roles.iter().any(|r| r == role));

    let login_route = login_route.to_owned();
    let options = GuardOptions::new()
        .require_roles(roles.iter().cloned())
        .on_unauthenticated(move || eprintln!("sign in first: {login_route}"))
        .on_unauthorized(|| eprintln!("signed in, but missing every required role"));
    let mut guard = AccessGuard::new(scheduler.clone(), Some(role_check), options);

    let access = guard.evaluate(&state);
    scheduler.run_pending();

    print_json(&json!({
        "access": access_name(access),
        "required_roles": roles,
        "user": state.subject,
    }))
}

fn access_name(access: Access) -> &'static str {
    match access {
        Access::Loading => "loading",
        Access::Unauthenticated => "unauthenticated",
        Access::Unauthorized => "unauthorized",
        Access::Granted => "granted",
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

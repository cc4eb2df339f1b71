mod access;
mod auth;
mod cas;
mod config;
mod pipeline;
mod server;
mod storage;
mod utils;

#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing::info;

use auth::{SessionSigner, SESSION_COOKIE};
use config::{AppConfig, DEFAULT_CONFIG_PATH};
use storage::models::{NewUser, Role};
use storage::Database;
use utils::logger;

#[derive(Parser)]
#[command(name = "cas-gateway")]
#[command(about = "客户分析服务 (CAS) 网关", long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 初始化配置和数据库
    Init,
    /// 启动网关
    Serve,
    /// 用户管理
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// 为用户签发会话 cookie
    Session {
        user_id: i64,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// 注册用户
    Add {
        id: i64,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        username: Option<String>,
        /// 初始 token，默认取配置
        #[arg(long)]
        tokens: Option<i64>,
    },
    /// 修改角色 (user / manager / admin)
    Role { id: i64, role: Role },
    /// 充值 token
    Tokens { id: i64, amount: i64 },
    /// 封禁用户
    Ban { id: i64 },
    /// 解封用户
    Unban { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logger();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_command(&cli.config).await?;
        }
        Commands::Serve => {
            let config = AppConfig::load(&cli.config)?;
            info!("cas-gateway 启动");
            let db = open_database(&config).await?;
            server::serve(config, db).await?;
        }
        Commands::User { action } => {
            user_command(&cli.config, action).await?;
        }
        Commands::Session { user_id } => {
            session_command(&cli.config, user_id).await?;
        }
    }

    Ok(())
}

async fn open_database(config: &AppConfig) -> Result<Database> {
    if let Some(parent) = Path::new(&config.storage.database_path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let db = Database::new(&config.database_url()).await?;
    db.init_schema().await?;
    Ok(db)
}

async fn init_command(config_path: &str) -> Result<()> {
    info!("初始化系统...");

    if let Some(parent) = Path::new(config_path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let config = if Path::new(config_path).exists() {
        info!("配置文件已存在，保留: {}", config_path);
        AppConfig::load(config_path)?
    } else {
        let config = AppConfig::default();
        config.save(config_path)?;
        info!("已生成配置文件: {}", config_path);
        config
    };

    info!("正在初始化数据库: {}", config.database_url());
    open_database(&config).await?;
    info!("数据库初始化完成");

    info!("✅ 系统初始化完成！");
    info!("下一步:");
    info!("  1. 编辑 {} 配置 CAS 地址与密钥", config_path);
    info!("  2. 运行 'cas-gateway user add' 注册管理员");
    info!("  3. 运行 'cas-gateway serve' 启动网关");

    Ok(())
}

/// 运维命令，写入的活动日志 user_from 为空
async fn user_command(config_path: &str, action: UserAction) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let db = open_database(&config).await?;

    match action {
        UserAction::Add {
            id,
            first_name,
            last_name,
            username,
            tokens,
        } => {
            let new_user = NewUser {
                id,
                first_name,
                last_name,
                username,
            };
            let tokens = tokens.unwrap_or(config.storage.default_user_tokens);
            let user = db.create_user(&new_user, tokens).await?;
            db.log_action(None, id, "Registered by operator").await?;
            info!("✅ 用户已注册: {} ({}), token: {}", user.id, user.first_name, user.tokens);
        }
        UserAction::Role { id, role } => {
            let user = db.set_role(id, role).await?;
            db.log_action(None, id, &format!("Changed role to {}", role))
                .await?;
            info!("✅ 用户 {} 角色: {}", user.id, user.role);
        }
        UserAction::Tokens { id, amount } => {
            let user = db.add_tokens(id, amount).await?;
            db.log_action(None, id, &format!("Credited {} tokens", amount))
                .await?;
            info!("✅ 用户 {} 当前 token: {}", user.id, user.tokens);
        }
        UserAction::Ban { id } => {
            db.set_active(id, false).await?;
            db.log_action(None, id, "Banned").await?;
            info!("✅ 用户 {} 已封禁", id);
        }
        UserAction::Unban { id } => {
            db.set_active(id, true).await?;
            db.log_action(None, id, "Unbanned").await?;
            info!("✅ 用户 {} 已解封", id);
        }
    }

    Ok(())
}

async fn session_command(config_path: &str, user_id: i64) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let db = open_database(&config).await?;
    if db.get_user(user_id).await?.is_none() {
        anyhow::bail!("用户不存在: {}", user_id);
    }

    let signer = SessionSigner::from_config(&config.auth);
    let token = signer.issue(user_id);
    info!("会话有效期 {} 分钟", config.auth.session_ttl_minutes);
    println!("{}={}", SESSION_COOKIE, token);
    Ok(())
}

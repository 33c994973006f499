//! Command handlers
//!
//! Each subcommand maps onto one `ResumeFacade::resume` call, except `init`,
//! which records a brand-new upgrade under the state lock.

use crate::cli::Commands;
use crate::executor::PlanExecutor;
use anyhow::{bail, Context, Result};
use cutover_common::{
    CutoverConfig, Mode, NetworkState, ResumeFacade, ResumeInput, ResumeOptions, ResumeResult,
    RpcNetworkState, StateDetector, StateStore, StateTransitioner, UpgradeState,
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tracing::{info, info_span, Span};

/// Wire the facade for a deployment home, all components under `root`
pub fn build_facade(
    config: &CutoverConfig,
    network: Arc<dyn NetworkState>,
    root: &Span,
) -> ResumeFacade {
    let home = config.home_dir();
    let transitioner = StateTransitioner::new(info_span!(parent: root, "transition"));
    ResumeFacade::new(
        StateStore::new(&home, info_span!(parent: root, "store", home = %home.display())),
        StateDetector::new(
            network,
            config.detector_config(),
            info_span!(parent: root, "detector"),
        ),
        transitioner.clone(),
        Arc::new(PlanExecutor::new(transitioner)),
        info_span!(parent: root, "resume"),
    )
}

pub async fn run(command: Commands, config: &CutoverConfig, root: &Span) -> Result<()> {
    let network: Arc<dyn NetworkState> = Arc::new(
        RpcNetworkState::new(&config.network, info_span!(parent: root, "rpc"))
            .context("Failed to set up network client")?,
    );
    let facade = build_facade(config, network, root);

    match command {
        Commands::Resume {
            upgrade_name,
            target_version,
        } => {
            let input = ResumeInput {
                upgrade_name,
                target_version,
            };
            let result = facade.resume(&input, &ResumeOptions::default()).await?;
            print_result(&result);
        }
        Commands::Status { json } => {
            let options = ResumeOptions {
                show_status: true,
                ..Default::default()
            };
            let result = facade.resume(&ResumeInput::default(), &options).await?;
            print_status(&result, json)?;
        }
        Commands::ClearState => {
            let options = ResumeOptions {
                clear_state: true,
                ..Default::default()
            };
            let result = facade.resume(&ResumeInput::default(), &options).await?;
            print_result(&result);
        }
        Commands::ForceRestart => {
            let options = ResumeOptions {
                force_restart: true,
                ..Default::default()
            };
            let result = facade.resume(&ResumeInput::default(), &options).await?;
            print_result(&result);
        }
        Commands::Init {
            name,
            mode,
            skip_governance,
            target_version,
            target_binary,
            target_image,
        } => {
            let mode: Mode = mode.parse()?;
            let state = UpgradeState::new(&name, mode, skip_governance).with_target(
                target_binary.as_deref().unwrap_or_default(),
                target_version.as_deref().unwrap_or_default(),
                target_image.as_deref().unwrap_or_default(),
            );
            let state = init_state(facade.store(), state)?;
            println!(
                "{}  recorded upgrade '{}' at stage {}",
                "✓".bright_green(),
                state.upgrade_name,
                state.stage
            );
        }
    }
    Ok(())
}

/// Save a new upgrade unless a non-terminal one is already recorded
pub fn init_state(store: &StateStore, mut state: UpgradeState) -> Result<UpgradeState> {
    let lock = store.acquire_lock()?;
    if let Some(existing) = store.load_state()? {
        if !existing.is_terminal() {
            bail!(
                "upgrade '{}' is still at stage {}; resume it or run clear-state first",
                existing.upgrade_name,
                existing.stage
            );
        }
        info!(
            previous = %existing.upgrade_name,
            stage = %existing.stage,
            "replacing terminal upgrade state"
        );
    }
    store
        .save_state(&mut state)
        .with_context(|| format!("Failed to save state for '{}'", state.upgrade_name))?;
    lock.release()?;
    Ok(state)
}

fn print_result(result: &ResumeResult) {
    let marker = if result.resumed {
        "✓".bright_green().to_string()
    } else {
        "•".bright_blue().to_string()
    };
    println!("{}  {}", marker, result.message);
}

fn print_status(result: &ResumeResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&result.state)?);
        return Ok(());
    }
    match &result.state {
        Some(state) => {
            println!("{}", result.message.bright_white().bold());
            for line in state.summary_lines() {
                println!("   {}", line);
            }
        }
        None => println!("{}", "No existing upgrade state found".dimmed()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_common::{FakeNetworkState, Stage};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> CutoverConfig {
        CutoverConfig {
            home: Some(PathBuf::from(temp.path())),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_refuses_active_upgrade() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path(), Span::none());

        init_state(&store, UpgradeState::new("v2.0.0", Mode::Local, false)).unwrap();
        let err = init_state(&store, UpgradeState::new("v3.0.0", Mode::Local, false)).unwrap_err();
        assert!(err.to_string().contains("clear-state"));
        assert_eq!(store.load_state().unwrap().unwrap().upgrade_name, "v2.0.0");
    }

    #[test]
    fn test_init_replaces_terminal_upgrade() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path(), Span::none());
        let t = StateTransitioner::default();

        let mut old = UpgradeState::new("v2.0.0", Mode::Local, true);
        t.transition_to(&mut old, Stage::Failed, "aborted").unwrap();
        store.save_state(&mut old).unwrap();

        let new = init_state(&store, UpgradeState::new("v3.0.0", Mode::Local, true)).unwrap();
        assert_eq!(store.load_state().unwrap().unwrap(), new);
    }

    #[tokio::test]
    async fn test_facade_uses_config_home() {
        let temp = TempDir::new().unwrap();
        let facade = build_facade(
            &config(&temp),
            Arc::new(FakeNetworkState::running()),
            &Span::none(),
        );
        assert_eq!(facade.store().home(), temp.path());

        init_state(facade.store(), UpgradeState::new("v2.0.0", Mode::Docker, true)).unwrap();
        let result = facade
            .resume(&ResumeInput::default(), &ResumeOptions::default())
            .await
            .unwrap();
        assert!(result.resumed);
    }
}

// ABOUTME: Operator subcommands that inspect config and persisted state without going online
// ABOUTME: Config summary, per-bot session listing, and the lingering chance table

use anyhow::{Context, Result};
use charbridge_core::config::Config;
use charbridge_core::linger::{LingerCurve, ACCEPT_THRESHOLD};
use charbridge_core::session::{SessionBinding, SessionStore, SqliteSessionStore};
use serde::Serialize;
use std::fmt::Write;

/// Human-readable summary of a validated config
pub fn check_report(config: &Config) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Configuration OK: {} bot(s)", config.bots.len());
    for bot in &config.bots {
        let _ = writeln!(
            out,
            "  {} -> character {} (greeting on new session: {})",
            bot.name,
            bot.character_id,
            if bot.greeting_on_new_session { "yes" } else { "no" }
        );
    }

    let linger = &config.lingering;
    if linger.enabled {
        let _ = writeln!(
            out,
            "Lingering: {:?} dropoff, chance {}, timeout {}s, exponent {}",
            linger.dropoff, linger.chance, linger.timeout_secs, linger.exponent_curve
        );
    } else {
        let _ = writeln!(out, "Lingering: off");
    }
    let _ = writeln!(
        out,
        "Dispatch: {} attempt(s), backoff {}s on malformed responses",
        config.dispatch.max_attempts, config.backend.malformed_backoff_secs
    );
    let _ = write!(out, "Workspace: {}", config.workspace.path);
    out
}

/// Session binding tagged with the bot that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotSession {
    pub bot: String,
    #[serde(flatten)]
    pub binding: SessionBinding,
}

/// Persisted bindings for one bot, or for every bot when `bot` is None.
/// Bots that never stored anything are skipped rather than created.
pub fn list_sessions(config: &Config, bot: Option<&str>) -> Result<Vec<BotSession>> {
    if let Some(name) = bot {
        if config.bot(name).is_none() {
            anyhow::bail!("No bot named '{}' in config", name);
        }
    }

    let mut sessions = Vec::new();
    for entry in config.bots.iter().filter(|b| bot.map_or(true, |n| n == b.name)) {
        let db_path = config.bot_data_dir(&entry.name).join("sessions.db");
        if !db_path.exists() {
            continue;
        }
        let store = SqliteSessionStore::new(&db_path)
            .with_context(|| format!("Failed to open sessions for {}", entry.name))?;
        sessions.extend(store.list()?.into_iter().map(|binding| BotSession {
            bot: entry.name.clone(),
            binding,
        }));
    }
    Ok(sessions)
}

pub fn render_sessions(sessions: &[BotSession]) -> String {
    if sessions.is_empty() {
        return "No sessions stored".to_string();
    }
    let mut out = String::new();
    for s in sessions {
        let _ = writeln!(
            out,
            "{:<16} {:<28} {}  ({})",
            s.bot, s.binding.surface_key, s.binding.session_id, s.binding.updated_at
        );
    }
    out.trim_end().to_string()
}

/// One row of the chance table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    pub elapsed_secs: f64,
    pub chance: f64,
    pub accepted: bool,
}

/// Sample the curve every `step` seconds up to and including the timeout
pub fn curve_points(curve: &LingerCurve, step: f64) -> Result<Vec<CurvePoint>> {
    if !(step > 0.0) {
        anyhow::bail!("step must be positive, got {}", step);
    }
    if !curve.timeout_secs.is_finite() {
        anyhow::bail!("lingering timeout must be finite, got {}", curve.timeout_secs);
    }
    let steps = (curve.timeout_secs / step).ceil() as usize;
    Ok((0..=steps)
        .map(|i| {
            let elapsed_secs = (i as f64 * step).min(curve.timeout_secs);
            CurvePoint {
                elapsed_secs,
                chance: curve.chance(elapsed_secs),
                accepted: curve.accepts(elapsed_secs),
            }
        })
        .collect())
}

pub fn render_curve(points: &[CurvePoint]) -> String {
    let mut out = format!("{:>8}  {:>7}  accepted (> {})\n", "t (s)", "chance", ACCEPT_THRESHOLD);
    for p in points {
        let _ = writeln!(
            out,
            "{:>8.2}  {:>7.2}  {}",
            p.elapsed_secs,
            p.chance,
            if p.accepted { "yes" } else { "no" }
        );
    }
    out.trim_end().to_string()
}

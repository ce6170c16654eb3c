//! Configuration snapshots: bulk fetch, structure parsing, caching.
//!
//! RTX exposes its running configuration as a flat text file
//! (`/system/configN`). Reading it over SFTP in one transfer replaces
//! dozens of paginated `show config` exchanges, and the parsed form
//! lets callers reason about context-scoped commands (`tunnel select`,
//! `pp select`) without re-parsing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::debug;
use regex::Regex;
use serde::Serialize;

use crate::error::Result;

/// Fallback when the active config number cannot be determined. The
/// leading slash is required for RTX SFTP access.
pub const DEFAULT_CONFIG_PATH: &str = "/system/config0";

/// Default cache validity window.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(5 * 60);

/// The configuration context a command line belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ConfigContext {
    Global,
    /// `tunnel select N`
    Tunnel(u32),
    /// `pp select N`
    Pp(u32),
    /// `pp select anonymous`
    PpAnonymous,
    /// `ipsec tunnel N`, nested inside a tunnel context.
    IpsecTunnel(u32),
}

/// One command line with its position and context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedCommand {
    pub line: String,
    pub line_number: usize,
    pub context: ConfigContext,
}

/// The structured view of one configuration file.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedConfig {
    raw: String,
    line_count: usize,
    commands: Vec<ParsedCommand>,
    contexts: Vec<ConfigContext>,
}

impl ParsedConfig {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Non-empty lines, comments included.
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[ParsedCommand] {
        &self.commands
    }

    /// Every context that appeared, in order of first appearance.
    pub fn contexts(&self) -> &[ConfigContext] {
        &self.contexts
    }

    pub fn global_commands(&self) -> impl Iterator<Item = &ParsedCommand> {
        self.commands
            .iter()
            .filter(|c| c.context == ConfigContext::Global)
    }

    pub fn commands_in_context<'a>(
        &'a self,
        context: &ConfigContext,
    ) -> impl Iterator<Item = &'a ParsedCommand> {
        self.commands.iter().filter(move |c| c.context == *context)
    }

    /// Commands whose line starts with `prefix`, any context.
    pub fn commands_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a ParsedCommand> {
        self.commands.iter().filter(move |c| c.line.starts_with(prefix))
    }

    /// Commands grouped by context, preserving first-appearance order.
    pub fn grouped_by_context(&self) -> IndexMap<ConfigContext, Vec<&ParsedCommand>> {
        let mut grouped: IndexMap<ConfigContext, Vec<&ParsedCommand>> = IndexMap::new();
        for cmd in &self.commands {
            grouped.entry(cmd.context.clone()).or_default().push(cmd);
        }
        grouped
    }
}

/// Strategy turning raw config text into a [`ParsedConfig`].
pub trait ConfigParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<ParsedConfig>;
}

/// Default parser for RTX `config.txt` files.
pub struct RtxConfigParser {
    tunnel_select: Regex,
    pp_select: Regex,
    pp_select_anonymous: Regex,
    ipsec_tunnel: Regex,
}

impl RtxConfigParser {
    pub fn new() -> Self {
        Self {
            tunnel_select: Regex::new(r"^tunnel[ \t]+select[ \t]+([0-9]+)$").unwrap(),
            pp_select: Regex::new(r"^pp[ \t]+select[ \t]+([0-9]+)$").unwrap(),
            pp_select_anonymous: Regex::new(r"^pp[ \t]+select[ \t]+anonymous$").unwrap(),
            ipsec_tunnel: Regex::new(r"^ipsec[ \t]+tunnel[ \t]+([0-9]+)$").unwrap(),
        }
    }

    fn detect_context(&self, line: &str) -> Option<ConfigContext> {
        if let Some(caps) = self.tunnel_select.captures(line) {
            return caps[1].parse().ok().map(ConfigContext::Tunnel);
        }
        if let Some(caps) = self.pp_select.captures(line) {
            return caps[1].parse().ok().map(ConfigContext::Pp);
        }
        if self.pp_select_anonymous.is_match(line) {
            return Some(ConfigContext::PpAnonymous);
        }
        if let Some(caps) = self.ipsec_tunnel.captures(line) {
            return caps[1].parse().ok().map(ConfigContext::IpsecTunnel);
        }
        None
    }

    /// `tunnel enable N` / `pp enable N` close their context.
    fn is_context_exit(line: &str) -> bool {
        line.starts_with("tunnel enable") || line.starts_with("pp enable")
    }

    /// Lines inside an `ipsec tunnel` block that actually belong to
    /// the enclosing tunnel context.
    fn belongs_to_parent_tunnel(line: &str) -> bool {
        line.starts_with("l2tp ")
            || line.starts_with("tunnel endpoint")
            || line.starts_with("tunnel enable")
            || line.starts_with("ip tunnel ")
    }
}

impl Default for RtxConfigParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigParser for RtxConfigParser {
    fn parse(&self, raw: &str) -> Result<ParsedConfig> {
        let mut line_count = 0;
        let mut commands = Vec::new();
        let mut contexts: Vec<ConfigContext> = Vec::new();

        let mut current = ConfigContext::Global;
        // Holds the enclosing tunnel while inside an `ipsec tunnel`
        // block.
        let mut parent: Option<ConfigContext> = None;

        for (idx, line) in raw.lines().enumerate() {
            let line_number = idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            line_count += 1;
            if trimmed.starts_with('#') {
                continue;
            }

            if let Some(context) = self.detect_context(trimmed) {
                if matches!(context, ConfigContext::IpsecTunnel(_))
                    && matches!(current, ConfigContext::Tunnel(_))
                {
                    parent = Some(current.clone());
                } else {
                    parent = None;
                }
                current = context.clone();
                if !contexts.contains(&context) {
                    contexts.push(context);
                }
                continue;
            }

            // A tunnel-level command inside an ipsec block pops back to
            // the tunnel.
            if matches!(current, ConfigContext::IpsecTunnel(_))
                && Self::belongs_to_parent_tunnel(trimmed)
            {
                if let Some(tunnel) = parent.take() {
                    current = tunnel;
                }
            }

            let exits = current != ConfigContext::Global && Self::is_context_exit(trimmed);

            commands.push(ParsedCommand {
                line: trimmed.to_string(),
                line_number,
                context: current.clone(),
            });

            if exits {
                current = ConfigContext::Global;
                parent = None;
            }
        }

        Ok(ParsedConfig {
            raw: raw.to_string(),
            line_count,
            commands,
            contexts,
        })
    }
}

/// One fetched-and-parsed configuration. Immutable; a newer fetch
/// produces a new snapshot.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub parsed: ParsedConfig,
    pub fetched_at: Instant,
}

/// TTL plus dirty-flag cache of the latest snapshot.
///
/// `mark_dirty` is called after every mutation batch; a dirty cache
/// never serves its snapshot even inside the TTL window.
pub struct SnapshotCache {
    ttl: Duration,
    state: std::sync::Mutex<CacheState>,
}

struct CacheState {
    snapshot: Option<Arc<ConfigSnapshot>>,
    dirty: bool,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: std::sync::Mutex::new(CacheState {
                snapshot: None,
                dirty: false,
            }),
        }
    }

    /// The cached snapshot, if it is still fresh and clean.
    pub fn get(&self) -> Option<Arc<ConfigSnapshot>> {
        let state = self.state.lock().unwrap();
        let snapshot = state.snapshot.as_ref()?;
        if state.dirty || snapshot.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(snapshot.clone())
    }

    /// Store a fresh snapshot, clearing the dirty flag.
    pub fn store(&self, parsed: ParsedConfig) -> Arc<ConfigSnapshot> {
        let snapshot = Arc::new(ConfigSnapshot {
            parsed,
            fetched_at: Instant::now(),
        });
        let mut state = self.state.lock().unwrap();
        state.snapshot = Some(snapshot.clone());
        state.dirty = false;
        snapshot
    }

    /// Flag the cached snapshot as stale after a mutation.
    pub fn mark_dirty(&self) {
        debug!("snapshot cache marked dirty");
        self.state.lock().unwrap().dirty = true;
    }

    /// Drop the cached snapshot entirely.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap();
        state.snapshot = None;
        state.dirty = false;
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_TTL)
    }
}

/// Extract the active config file path from `show environment` output.
///
/// Handles English and Japanese firmware locales; anything else falls
/// back to [`DEFAULT_CONFIG_PATH`].
pub fn config_path_from_environment(output: &str) -> String {
    let patterns = [
        Regex::new(r"[Dd]efault[ \t]+config[ \t]+file[ \t]*:[ \t]*config([0-9]+)").unwrap(),
        Regex::new(r"デフォルト設定ファイル[ \t]*:[ \t]*config([0-9]+)").unwrap(),
    ];

    for pattern in &patterns {
        if let Some(caps) = pattern.captures(output) {
            if let Ok(num) = caps[1].parse::<u32>() {
                return format!("/system/config{num}");
            }
        }
    }
    DEFAULT_CONFIG_PATH.to_string()
}

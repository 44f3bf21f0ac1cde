//! Command console.
//!
//! Provides:
//! - A closed command table plus an alias table (no cvars in this domain).
//! - Privilege-gated execution (`Command::run` refuses below its minimum).
//! - Line parsing into a command name and arguments.
//!
//! Commands take an explicit [`ConsoleCapabilities`] object rather than
//! reaching for a global singleton the way the reference implementation's
//! command callbacks reach `get_server_thread()`.

use std::collections::HashMap;

use anyhow::bail;
use uuid::Uuid;

use crate::net::ClientId;
use crate::registry::Client;

/// What a command callback is allowed to do, supplied by whoever owns the
/// dispatcher, registry, and relay — the console itself knows none of them.
pub trait ConsoleCapabilities: Send + Sync {
    fn list_players(&self) -> HashMap<String, ClientId>;
    fn kick_player(&self, name: &str, reason: &str) -> bool;
    fn waiting_packet_ids(&self) -> Vec<Uuid>;
    fn request_shutdown(&self);
}

/// Command handler signature. Returns the lines to print.
pub type CommandHandler =
    Box<dyn Fn(&[&str], &Client, &dyn ConsoleCapabilities) -> anyhow::Result<Vec<String>> + Send + Sync>;

/// A registered command.
pub struct Command {
    pub name: String,
    handler: CommandHandler,
    pub privilege_req: i32,
    /// Parameter names, for `commands`' help listing.
    pub params: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, handler: CommandHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            privilege_req: 0,
            params: Vec::new(),
        }
    }

    pub fn with_privilege(mut self, privilege_req: i32) -> Self {
        self.privilege_req = privilege_req;
        self
    }

    pub fn with_params(mut self, params: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Runs the command, refusing when `executor`'s privilege is below
    /// `privilege_req`.
    pub fn run(
        &self,
        args: &[&str],
        executor: &Client,
        caps: &dyn ConsoleCapabilities,
    ) -> anyhow::Result<Vec<String>> {
        if self.privilege_req > 0 && self.privilege_req > executor.privilege_level {
            bail!("insufficient permission to run '{}'", self.name);
        }
        (self.handler)(args, executor, caps)
    }
}

/// Resolves command names (and their aliases) to a [`Command`] and runs it.
pub struct CommandProcessor {
    commands: HashMap<String, Command>,
    aliases: HashMap<String, String>,
    history: Vec<String>,
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            aliases: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// Builds a processor with the built-in command set from the server
    /// dispatcher's contract: `commands`, `end` (+ `stop`/`die`/`q`/`quit`),
    /// `printqueue`, `listplayers` (+ `list`/`lp`/`online`), `kick <name>`.
    pub fn with_builtins() -> Self {
        let mut processor = Self::new();

        processor.add_command(Command::new(
            "commands",
            Box::new(|_args, _executor, _caps| Ok(vec!["commands".to_string()])),
        ));

        processor.add_command(
            Command::new(
                "end",
                Box::new(|_args, _executor, caps| {
                    caps.request_shutdown();
                    Ok(vec!["Stopping server".to_string()])
                }),
            )
            .with_privilege(99),
        );
        for alias in ["stop", "die", "q", "quit"] {
            processor.set_alias("end", alias);
        }

        processor.add_command(
            Command::new(
                "printqueue",
                Box::new(|_args, _executor, caps| {
                    let ids = caps.waiting_packet_ids();
                    Ok(ids.iter().map(|id| id.to_string()).collect())
                }),
            )
            .with_privilege(99),
        );

        processor.add_command(Command::new(
            "listplayers",
            Box::new(|_args, _executor, caps| {
                Ok(caps
                    .list_players()
                    .into_iter()
                    .map(|(name, id)| format!("{name} ({id})"))
                    .collect())
            }),
        ));
        for alias in ["list", "lp", "online"] {
            processor.set_alias("listplayers", alias);
        }

        processor.add_command(
            Command::new(
                "kick",
                Box::new(|args, _executor, caps| {
                    let Some(name) = args.first() else {
                        bail!("usage: kick <name>");
                    };
                    let kicked = caps.kick_player(name, "Kicked by an operator.");
                    Ok(vec![format!("kicked {name}: {kicked}")])
                }),
            )
            .with_privilege(10)
            .with_params(["name"]),
        );

        processor
    }

    pub fn add_command(&mut self, command: Command) {
        self.commands.insert(command.name.clone(), command);
    }

    pub fn set_alias(&mut self, name: impl Into<String>, alias: impl Into<String>) {
        self.aliases.insert(alias.into(), name.into());
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    /// Looks a command name up directly, then through the alias table.
    pub fn run_command(
        &self,
        name: &str,
        args: &[&str],
        executor: &Client,
        caps: &dyn ConsoleCapabilities,
    ) -> anyhow::Result<Vec<String>> {
        let command = self
            .commands
            .get(name)
            .or_else(|| self.aliases.get(name).and_then(|real| self.commands.get(real)));
        match command {
            Some(command) => command.run(args, executor, caps),
            None => bail!("unknown command: {name}"),
        }
    }

    /// Splits `line` on whitespace, lowercases the command name, and runs
    /// it. Records the raw line in history regardless of outcome.
    pub fn parse_command(
        &mut self,
        line: &str,
        executor: &Client,
        caps: &dyn ConsoleCapabilities,
    ) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        if line.is_empty() {
            bail!("empty command");
        }
        self.history.push(line.to_string());

        let tokens = parse_command_line(line);
        let cmd_name = tokens[0].to_lowercase();
        let args: Vec<&str> = tokens[1..].iter().map(|s| s.as_str()).collect();
        self.run_command(&cmd_name, &args, executor, caps)
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }
}

/// Parses a command line into tokens, respecting quotes.
pub fn parse_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::IVec2;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    struct NoopCapabilities;
    impl ConsoleCapabilities for NoopCapabilities {
        fn list_players(&self) -> HashMap<String, ClientId> {
            HashMap::new()
        }
        fn kick_player(&self, _name: &str, _reason: &str) -> bool {
            true
        }
        fn waiting_packet_ids(&self) -> Vec<Uuid> {
            Vec::new()
        }
        fn request_shutdown(&self) {}
    }

    fn executor(privilege_level: i32) -> Client {
        Client::new(
            ClientId::new_unique(),
            "tester".to_string(),
            "sess".to_string(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            privilege_level,
            IVec2::ZERO,
            IVec2::ZERO,
        )
    }

    #[test]
    fn parse_quoted_args() {
        let tokens = parse_command_line(r#"say "hello world" test"#);
        assert_eq!(tokens, vec!["say", "hello world", "test"]);
    }

    #[test]
    fn low_privilege_cannot_run_end() {
        let processor = CommandProcessor::with_builtins();
        let executor = executor(0);
        let result = processor.run_command("end", &[], &executor, &NoopCapabilities);
        assert!(result.is_err());
    }

    #[test]
    fn operator_can_run_end_through_alias() {
        let processor = CommandProcessor::with_builtins();
        let executor = executor(99);
        let result = processor.run_command("stop", &[], &executor, &NoopCapabilities);
        assert!(result.is_ok());
    }

    #[test]
    fn unknown_command_errors() {
        let processor = CommandProcessor::with_builtins();
        let executor = executor(0);
        let result = processor.run_command("nonexistent", &[], &executor, &NoopCapabilities);
        assert!(result.is_err());
    }

    #[test]
    fn kick_requires_privilege_ten() {
        let processor = CommandProcessor::with_builtins();
        let low = executor(5);
        assert!(processor.run_command("kick", &["dave"], &low, &NoopCapabilities).is_err());
        let high = executor(10);
        assert!(processor.run_command("kick", &["dave"], &high, &NoopCapabilities).is_ok());
    }
}

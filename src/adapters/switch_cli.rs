//! Runtime CLI Switch Adapter
//!
//! Implements [`SwitchControl`] by driving the target's runtime CLI
//! (`simple_switch_CLI --thrift-port N`). Each call spawns the CLI, writes a
//! single command to its stdin and parses the reply from stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::domain::ports::{EntryHandle, SwitchControl};
use crate::error::{Error, Result};

/// Default name of the runtime CLI binary.
pub const DEFAULT_CLI: &str = "simple_switch_CLI";

/// Switch driven through its runtime CLI.
#[derive(Debug, Clone)]
pub struct SwitchCli {
    program: String,
    thrift_port: u16,
}

impl SwitchCli {
    pub fn new(thrift_port: u16) -> Self {
        Self::with_program(DEFAULT_CLI, thrift_port)
    }

    pub fn with_program(program: impl Into<String>, thrift_port: u16) -> Self {
        Self {
            program: program.into(),
            thrift_port,
        }
    }

    pub fn thrift_port(&self) -> u16 {
        self.thrift_port
    }

    /// Run one CLI command and return its stdout.
    async fn run(&self, operation: &str, command: String) -> Result<String> {
        debug!(command = %command, "Switch CLI command");

        let mut child = Command::new(&self.program)
            .arg("--thrift-port")
            .arg(self.thrift_port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::rpc(operation, format!("failed to start {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n", command).as_bytes())
                .await
                .map_err(|e| Error::rpc(operation, e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::rpc(operation, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::rpc(
                operation,
                format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            ));
        }
        check_reply(operation, &stdout)?;
        Ok(stdout)
    }
}

#[async_trait]
impl SwitchControl for SwitchCli {
    #[instrument(skip(self, action_params), fields(port = self.thrift_port))]
    async fn add_entry(
        &self,
        table: &str,
        action: &str,
        match_key: &[String],
        action_params: &[String],
    ) -> Result<EntryHandle> {
        let command = format!(
            "table_add {} {} {} => {}",
            table,
            action,
            match_key.join(" "),
            action_params.join(" ")
        );
        let reply = self.run("add_entry", command).await?;
        parse_added_handle(&reply)
            .ok_or_else(|| Error::rpc("add_entry", format!("unexpected reply: {}", reply.trim())))
    }

    #[instrument(skip(self), fields(port = self.thrift_port))]
    async fn delete_entry(&self, table: &str, handle: EntryHandle) -> Result<()> {
        self.run("delete_entry", format!("table_delete {} {}", table, handle.0))
            .await
            .map(|_| ())
    }

    async fn get_handle(&self, table: &str, match_key: &[String]) -> Result<Option<EntryHandle>> {
        let command = format!("table_dump_entry_from_key {} {}", table, match_key.join(" "));
        match self.run("get_handle", command).await {
            Ok(reply) => Ok(parse_dumped_handle(&reply)),
            Err(Error::Rpc { reason, .. }) if reason.contains("BAD_MATCH_KEY") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_register(&self, register: &str, index: u32, value: u64) -> Result<()> {
        self.run(
            "write_register",
            format!("register_write {} {} {}", register, index, value),
        )
        .await
        .map(|_| ())
    }

    async fn read_register(&self, register: &str, index: u32) -> Result<u64> {
        let reply = self
            .run("read_register", format!("register_read {} {}", register, index))
            .await?;
        parse_register_value(&reply).ok_or_else(|| {
            Error::rpc("read_register", format!("unexpected reply: {}", reply.trim()))
        })
    }

    #[instrument(skip(self), fields(port = self.thrift_port))]
    async fn enable_mirroring(&self, session_id: u32, port: u32) -> Result<()> {
        self.run(
            "enable_mirroring",
            format!("mirroring_add {} {}", session_id, port),
        )
        .await
        .map(|_| ())
    }
}

// =============================================================================
// Reply Parsing
// =============================================================================

/// Map CLI error lines to an `Rpc` error.
fn check_reply(operation: &str, reply: &str) -> Result<()> {
    let failure = reply.lines().map(strip_prompt).find(|line| {
        line.starts_with("Error")
            || line.starts_with("Invalid")
            || line.contains("Could not connect")
    });
    match failure {
        Some(line) => Err(Error::rpc(operation, line.trim())),
        None => Ok(()),
    }
}

fn strip_prompt(line: &str) -> &str {
    line.trim_start_matches("RuntimeCmd:").trim()
}

/// `Entry has been added with handle 3`
fn parse_added_handle(reply: &str) -> Option<EntryHandle> {
    reply.lines().map(strip_prompt).find_map(|line| {
        line.strip_prefix("Entry has been added with handle")
            .and_then(|rest| rest.trim().parse().ok())
            .map(EntryHandle)
    })
}

/// `Dumping entry 0x3`
fn parse_dumped_handle(reply: &str) -> Option<EntryHandle> {
    reply.lines().map(strip_prompt).find_map(|line| {
        line.strip_prefix("Dumping entry")
            .and_then(|rest| parse_number(rest.trim()))
            .map(EntryHandle)
    })
}

/// `vt0[12]= 4702111234474983745`
fn parse_register_value(reply: &str) -> Option<u64> {
    reply.lines().map(strip_prompt).find_map(|line| {
        let (name, value) = line.split_once("]=")?;
        if !name.contains('[') {
            return None;
        }
        parse_number(value.trim())
    })
}

fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_added_handle() {
        let reply = "Obtaining JSON from switch...\nDone\nControl utility for runtime P4 table manipulation\n\
                     RuntimeCmd: Adding entry to exact match table lookup_table\n\
                     match key:           EXACT-00:00:00:00:00:00:00:00:00:00:00:00:00:61:62:63\n\
                     action:              set_lookup_metadata\n\
                     runtime data:        00:ff\t00:00:00:00\t00:00:ff:ff\n\
                     Entry has been added with handle 7\nRuntimeCmd: \n";
        assert_eq!(parse_added_handle(reply), Some(EntryHandle(7)));
        assert_eq!(parse_added_handle("RuntimeCmd: \n"), None);
    }

    #[test]
    fn test_parse_dumped_handle() {
        let reply = "RuntimeCmd: Dumping entry 0x1a\nMatch key:\n* key: EXACT 0x616263\n";
        assert_eq!(parse_dumped_handle(reply), Some(EntryHandle(0x1a)));
    }

    #[test]
    fn test_parse_register_value() {
        assert_eq!(parse_register_value("RuntimeCmd: vt3[12]= 42\n"), Some(42));
        assert_eq!(parse_register_value("cache_status[0]=  0\n"), Some(0));
        assert_eq!(parse_register_value("nothing here\n"), None);
    }

    #[test]
    fn test_error_lines_become_rpc_errors() {
        assert_matches!(
            check_reply("delete_entry", "RuntimeCmd: Invalid table operation (INVALID_HANDLE)\n"),
            Err(Error::Rpc { .. })
        );
        assert_matches!(
            check_reply("add_entry", "Error: Invalid table name (foo)\n"),
            Err(Error::Rpc { .. })
        );
        assert!(check_reply("write_register", "RuntimeCmd: \n").is_ok());
    }

    #[tokio::test]
    async fn test_missing_binary_is_rpc_error() {
        let cli = SwitchCli::with_program("/nonexistent/simple_switch_CLI", 9090);
        assert_matches!(
            cli.write_register("vt0", 0, 1).await,
            Err(Error::Rpc { .. })
        );
    }
}

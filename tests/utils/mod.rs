use anyhow::Result;
use std::process::Command;

use super::common::TestEnvironment;

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run the lipsync binary with the environment's config file.
pub fn run_lipsync_command(env: &TestEnvironment, args: &[&str]) -> Result<CommandOutput> {
    run_lipsync_command_with(env, args, &[])
}

pub fn run_lipsync_command_with(
    env: &TestEnvironment,
    args: &[&str],
    vars: &[(&str, &str)],
) -> Result<CommandOutput> {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_lipsync"));
    cmd.arg("--config")
        .arg(env.config_path())
        .args(args)
        .current_dir(env.path())
        .env("NO_COLOR", "1")
        .env_remove("PYTHONPATH");
    for (key, value) in vars {
        cmd.env(key, value);
    }

    let output = cmd.output()?;
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

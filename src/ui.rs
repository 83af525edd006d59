use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use colored::Colorize;

/// Prompts for a single visible value on stdin.
pub fn get_value_from_user(label: &str) -> Result<String> {
    print!("{}", format!("Enter value for '{}': ", label).green());
    io::stdout().flush()?;
    let mut text = String::new();
    io::stdin()
        .lock()
        .read_line(&mut text)
        .with_context(|| format!("could not read value for '{}'", label))?;
    Ok(text.trim().to_string())
}

/// Prompts for a secret; input is read without echo.
pub fn get_secret_from_user(label: &str) -> Result<String> {
    print!("{}", format!("Enter value for '{}' (hidden): ", label).green());
    io::stdout().flush()?;
    let secret = rpassword::read_password()
        .with_context(|| format!("could not read secret for '{}'", label))?;
    Ok(secret.trim().to_string())
}

//! AK-015: Lab — a named recipe registry with a CLI front-end.
//!
//! A lab collects recipes under their names and exposes the `status` and
//! `brew` subcommands over them. Argument recipes registered with the lab
//! become `--<name>` flags of `brew` (hyphens in names are preserved). The
//! command tree is assembled at runtime because recipe and argument names
//! are only known then.

use crate::core::recipe::Recipe;
use crate::core::status::Status;
use crate::core::value::{Outputs, Value};
use crate::error::{AlkymiError, Result};
use clap::{Arg, ArgMatches, Command};
use indexmap::IndexMap;
use std::sync::Arc;

/// A named collection of recipes with a CLI entry point.
pub struct Lab {
    name: String,
    recipes: IndexMap<String, Arc<Recipe>>,
    args: IndexMap<String, Arc<Recipe>>,
}

impl Lab {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            recipes: IndexMap::new(),
            args: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a recipe under its name. Later registrations replace
    /// earlier ones with the same name.
    pub fn add_recipe(&mut self, recipe: &Arc<Recipe>) {
        self.recipes.insert(recipe.name().to_string(), recipe.clone());
    }

    /// Register an argument recipe; it becomes a `--<name>` flag of the
    /// `brew` subcommand.
    pub fn register_arg(&mut self, argument: &Arc<Recipe>) -> Result<()> {
        if argument.arg_value().is_none() {
            return Err(AlkymiError::user_code(
                argument.name(),
                "only argument recipes can be registered as lab arguments",
            ));
        }
        self.args
            .insert(argument.name().to_string(), argument.clone());
        self.recipes
            .insert(argument.name().to_string(), argument.clone());
        Ok(())
    }

    pub fn recipe(&self, name: &str) -> Option<&Arc<Recipe>> {
        self.recipes.get(name)
    }

    pub fn recipe_names(&self) -> impl Iterator<Item = &str> {
        self.recipes.keys().map(String::as_str)
    }

    /// Evaluate a registered recipe by name.
    pub fn brew(&self, name: &str, jobs: usize) -> Result<Outputs> {
        let recipe = self
            .recipes
            .get(name)
            .ok_or_else(|| AlkymiError::user_code(name, "unknown recipe"))?;
        recipe.brew(jobs)
    }

    /// Status of every registered recipe and its transitive ingredients.
    pub fn status(&self) -> Result<IndexMap<String, Status>> {
        let mut merged = IndexMap::new();
        for recipe in self.recipes.values() {
            for (name, status) in recipe.status()? {
                merged.insert(name, status);
            }
        }
        Ok(merged)
    }

    fn command(&self) -> Command {
        let mut brew = Command::new("brew")
            .about("Brew the selected recipe")
            .arg(Arg::new("recipe").required(true).help("Recipe to brew"))
            .arg(
                Arg::new("jobs")
                    .long("jobs")
                    .value_name("N")
                    .default_value("1")
                    .value_parser(clap::value_parser!(usize))
                    .help("Parallel bound-function invocations"),
            );
        for (name, argument) in &self.args {
            let mut flag = Arg::new(name.clone())
                .long(name.clone())
                .value_name("VALUE");
            if let Some(doc) = argument.doc() {
                flag = flag.help(doc.to_string());
            }
            brew = brew.arg(flag);
        }

        Command::new(self.name.clone())
            .about(format!("CLI for the '{}' lab", self.name))
            .subcommand_required(true)
            .arg_required_else_help(true)
            .subcommand(Command::new("status").about("Print the status of every recipe"))
            .subcommand(brew)
    }

    /// Parse `argv` (including the program name) and execute the selected
    /// subcommand.
    pub fn dispatch<I, S>(&self, argv: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        let matches = self
            .command()
            .try_get_matches_from(argv)
            .map_err(|e| AlkymiError::user_code(&self.name, e.to_string()))?;
        self.execute(&matches)
    }

    /// Parse the process arguments and run; returns the exit code.
    pub fn open(&self) -> i32 {
        let argv: Vec<String> = std::env::args().collect();
        let matches = match self.command().try_get_matches_from(argv) {
            Ok(matches) => matches,
            Err(e) => {
                // Help and version requests land here too; clap knows the
                // right exit code either way.
                let _ = e.print();
                return e.exit_code();
            }
        };
        match self.execute(&matches) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {}", e);
                1
            }
        }
    }

    fn execute(&self, matches: &ArgMatches) -> Result<()> {
        match matches.subcommand() {
            Some(("status", _)) => self.cmd_status(),
            Some(("brew", sub)) => self.cmd_brew(sub),
            _ => Ok(()),
        }
    }

    fn cmd_status(&self) -> Result<()> {
        let statuses = self.status()?;
        println!("Lab: {} ({} recipes)", self.name, self.recipes.len());
        for (name, status) in &statuses {
            println!("  {}: {}", name, status);
        }
        Ok(())
    }

    fn cmd_brew(&self, sub: &ArgMatches) -> Result<()> {
        let recipe_name = sub
            .get_one::<String>("recipe")
            .map(String::as_str)
            .unwrap_or_default();
        let jobs = sub.get_one::<usize>("jobs").copied().unwrap_or(1);

        for (arg_name, argument) in &self.args {
            if let Some(raw) = sub.get_one::<String>(arg_name.as_str()) {
                argument.set(parse_cli_value(raw))?;
            }
        }

        let outputs = self.brew(recipe_name, jobs)?;
        println!("Brewed '{}' ({} outputs).", recipe_name, outputs.len());
        Ok(())
    }
}

/// Interpret a CLI flag value: integers, floats and booleans are parsed,
/// everything else stays a string.
fn parse_cli_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Str(raw.to_string()),
    }
}

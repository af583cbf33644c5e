//! Command-line arguments

use clap::{ArgGroup, Parser};
use meridian_planner::PlanRequest;
use meridian_schema::{Filter, FilterOp};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not of the form type.field=value")]
pub struct BadFilter(String);

/// Load platform schemas, then inspect the registry or plan a query
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("action").required(true).multiple(true).args(["dump", "deregister", "root_type"])))]
pub struct Args {
    /// Gateway configuration file
    #[arg(short, long, default_value = "meridian.yaml")]
    pub config: PathBuf,

    /// Print the merged registry as JSON
    #[arg(long)]
    pub dump: bool,

    /// Deregister a platform after loading and report the edges it leaves dangling
    #[arg(long, value_name = "PLATFORM")]
    pub deregister: Option<String>,

    /// Selection predicate, repeatable
    #[arg(short = 'w', long = "where", value_name = "TYPE.FIELD=VALUE", value_parser = parse_filter)]
    pub filters: Vec<Filter>,

    /// Type the query starts from
    pub root_type: Option<String>,

    /// Requested fields, bare or dotted (`users.user_email`)
    pub fields: Vec<String>,
}

impl Args {
    pub fn request(&self) -> Option<PlanRequest> {
        let root = self.root_type.as_ref()?;
        let request = PlanRequest::new(root.as_str(), self.fields.iter().map(String::as_str));
        Some(self.filters.iter().cloned().fold(request, PlanRequest::with_filter))
    }
}

/// `type.field=value`; the value is read as JSON, falling back to a string
fn parse_filter(clause: &str) -> Result<Filter, BadFilter> {
    let bad = || BadFilter(clause.to_string());
    let (target, raw) = clause.split_once('=').ok_or_else(bad)?;
    let (type_name, field) = target.split_once('.').ok_or_else(bad)?;
    if type_name.is_empty() || field.is_empty() {
        return Err(bad());
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok(Filter::new(type_name, field, FilterOp::Eq, value))
}

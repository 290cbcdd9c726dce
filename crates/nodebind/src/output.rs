use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use nodebind_runtime::{BinderUri, Configuration};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    service: &'a str,
    uri: String,
    reply: Option<&'a str>,
    oneway: bool,
    elapsed_ms: u128,
}

#[derive(Serialize)]
struct ServingOutput<'a> {
    node: u32,
    address: String,
    services: Vec<ServiceUri<'a>>,
}

#[derive(Serialize)]
struct ServiceUri<'a> {
    name: &'a str,
    uri: String,
}

/// Result of one call. `reply` is `None` for oneway sends.
pub fn print_reply(
    service: &str,
    uri: &BinderUri,
    reply: Option<&str>,
    elapsed: Duration,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                service,
                uri: uri.to_string(),
                reply,
                oneway: reply.is_none(),
                elapsed_ms: elapsed.as_millis(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "URI", "REPLY", "ELAPSED"])
                .add_row(vec![
                    service.to_string(),
                    uri.to_string(),
                    reply.unwrap_or("(oneway)").to_string(),
                    format!("{}ms", elapsed.as_millis()),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => match reply {
            Some(reply) => println!(
                "{service} ({uri}) replied {reply:?} in {}ms",
                elapsed.as_millis()
            ),
            None => println!("{service} ({uri}) notified"),
        },
        OutputFormat::Raw => {
            if let Some(reply) = reply {
                print_raw(reply.as_bytes());
            }
        }
    }
}

/// Announce a node that is up and accepting connections.
pub fn print_serving(
    node: u32,
    address: SocketAddr,
    services: &[(String, BinderUri)],
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let out = ServingOutput {
                node,
                address: address.to_string(),
                services: services
                    .iter()
                    .map(|(name, uri)| ServiceUri {
                        name,
                        uri: uri.to_string(),
                    })
                    .collect(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NODE", "ADDRESS", "SERVICE", "URI"]);
            for (name, uri) in services {
                table.add_row(vec![
                    node.to_string(),
                    address.to_string(),
                    name.clone(),
                    uri.to_string(),
                ]);
            }
            if services.is_empty() {
                table.add_row(vec![node.to_string(), address.to_string(), "-".into(), "-".into()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!("node {node} serving on {address}");
            for (name, uri) in services {
                println!("  {name} -> {uri}");
            }
        }
    }
    let _ = std::io::stdout().flush();
}

pub fn print_nodes(config: &Configuration, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(config),
        OutputFormat::Table => {
            let mut nodes = Table::new();
            nodes
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NODE", "URI"]);
            for node in &config.nodes {
                nodes.add_row(vec![node.id.to_string(), node.uri.clone()]);
            }
            println!("{nodes}");

            if !config.services.is_empty() {
                let mut services = Table::new();
                services
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec!["SERVICE", "NODE", "ID", "INTERFACE"]);
                for service in &config.services {
                    services.add_row(vec![
                        service.name.clone(),
                        service.node.to_string(),
                        service.id.to_string(),
                        service.interface.clone(),
                    ]);
                }
                println!("{services}");
            }
        }
        OutputFormat::Pretty => {
            for node in &config.nodes {
                println!("node {} at {}", node.id, node.uri);
            }
            for service in &config.services {
                println!(
                    "service {} ({}) on node {} as id {}",
                    service.name, service.interface, service.node, service.id
                );
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

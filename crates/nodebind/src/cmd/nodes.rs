use nodebind_runtime::Configuration;

use crate::cmd::NodesArgs;
use crate::exit::{config_error, CliResult, SUCCESS};
use crate::output::{print_nodes, OutputFormat};

pub fn run(args: NodesArgs, format: OutputFormat) -> CliResult<i32> {
    let config = Configuration::load(&args.config)
        .map_err(|err| config_error("failed to load config", err))?;
    print_nodes(&config, format);
    Ok(SUCCESS)
}

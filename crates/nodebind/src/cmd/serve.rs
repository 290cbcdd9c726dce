use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nodebind::greeter::{self, FriendlyGreeter};
use nodebind_runtime::{Configuration, Runtime, RuntimeConfig};
use tracing::{info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{
    binder_error, config_error, runtime_error, CliError, CliResult, INTERNAL, SUCCESS,
    TRANSPORT_ERROR, USAGE,
};
use crate::output::{print_serving, OutputFormat};

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = Configuration::load(&args.config)
        .map_err(|err| config_error("failed to load config", err))?;
    if config.node(args.node).is_none() {
        return Err(CliError::new(
            USAGE,
            format!("node {} is not in {}", args.node, args.config.display()),
        ));
    }

    let services: Vec<_> = config
        .services
        .iter()
        .filter(|service| service.node == args.node)
        .cloned()
        .collect();
    let runtime = Runtime::new(args.node, config, RuntimeConfig::default())
        .map_err(|err| runtime_error("failed to create runtime", err))?;

    let greeter = Arc::new(FriendlyGreeter::new());
    let mut exposed = Vec::new();
    for service in services {
        if service.interface != greeter::DESCRIPTOR {
            warn!(
                service = %service.name,
                interface = %service.interface,
                "no implementation for interface; not exposed"
            );
            continue;
        }
        let uri = runtime
            .add_service(&service.name, Arc::new(greeter::stub(Arc::clone(&greeter))))
            .map_err(|err| binder_error("failed to expose service", &err))?;
        exposed.push((service.name, uri));
    }

    runtime
        .start()
        .map_err(|err| runtime_error("failed to start runtime", err))?;
    let Some(address) = runtime.local_addr() else {
        runtime.shutdown();
        return Err(CliError::new(
            TRANSPORT_ERROR,
            format!("node {} could not listen on its configured address", args.node),
        ));
    };

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running))?;
    print_serving(args.node, address, &exposed, format);

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!(node = args.node, "shutting down");
    runtime.shutdown();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

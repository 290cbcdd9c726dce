use std::time::Instant;

use nodebind::greeter::GreeterProxy;
use nodebind_runtime::{Configuration, Runtime, RuntimeConfig};

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{binder_error, config_error, runtime_error, CliResult, SUCCESS};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = Configuration::load(&args.config)
        .map_err(|err| config_error("failed to load config", err))?;
    let settings = RuntimeConfig::default()
        .with_transaction_timeout(timeout)
        .with_connect_timeout(timeout)
        .with_shutdown_timeout(timeout);

    let runtime = Runtime::new(args.node, config, settings)
        .map_err(|err| runtime_error("failed to create runtime", err))?;
    runtime.register_interface::<GreeterProxy>();
    runtime
        .start()
        .map_err(|err| runtime_error("failed to start runtime", err))?;

    let result = call(&runtime, &args, format);
    runtime.shutdown();
    result
}

fn call(runtime: &Runtime, args: &CallArgs, format: OutputFormat) -> CliResult<i32> {
    let proxy = runtime
        .get_service(&args.service)
        .map_err(|err| binder_error("failed to resolve service", &err))?;
    let uri = proxy.uri().clone();
    let greeter = runtime
        .as_interface::<GreeterProxy>(proxy)
        .map_err(|err| binder_error("service is not a greeter", &err))?;

    let started = Instant::now();
    if args.oneway {
        greeter
            .notify(&args.message)
            .map_err(|err| binder_error("send failed", &err))?;
        print_reply(&args.service, &uri, None, started.elapsed(), format);
        return Ok(SUCCESS);
    }

    let pending = if args.async_reply {
        greeter.say_hello_async(&args.message)
    } else {
        greeter.say_hello(&args.message)
    };
    let reply = pending
        .wait()
        .map_err(|err| binder_error("call failed", &err))?;
    print_reply(&args.service, &uri, Some(&reply), started.elapsed(), format);
    Ok(SUCCESS)
}

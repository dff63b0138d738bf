use hdlclink_rpc::{RegistryConfig, ServiceRegistry};

use crate::cmd::{load_config, ServicesArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_services, OutputFormat};

pub fn run(args: ServicesArgs, format: OutputFormat) -> CliResult<i32> {
    let config = load_config(args.config.as_ref(), &args.protobufs)?;
    let registry = ServiceRegistry::from_paths(&config.protobufs, RegistryConfig::default())
        .map_err(|err| rpc_error("descriptor load failed", err))?;

    print_services(registry.services(), format);
    Ok(SUCCESS)
}

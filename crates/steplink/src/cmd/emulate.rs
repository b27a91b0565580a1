use steplink_driver::{Emulator, EmulatorConfig};
use steplink_transport::uds;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cmd::EmulateArgs;
use crate::exit::{io_error, transport_error, CliResult, SUCCESS};

pub async fn run(args: EmulateArgs) -> CliResult<i32> {
    let mut config = EmulatorConfig {
        motors: args.motors,
        ..EmulatorConfig::default()
    };
    if let Some(identity) = args.identity {
        config.identity = identity;
    }
    let emulator = Emulator::new(config);
    let listener = uds::listen(&args.path).map_err(|err| transport_error("bind failed", err))?;
    info!(path = %args.path.display(), motors = args.motors, "emulator listening");

    let mut hosts = JoinSet::new();
    let mut accepted = 0usize;
    let result = loop {
        if args.connections.is_some_and(|limit| accepted >= limit) {
            break Ok(());
        }
        tokio::select! {
            conn = listener.accept() => {
                let (stream, _) = match conn {
                    Ok(conn) => conn,
                    Err(err) => break Err(io_error("accept failed", err)),
                };
                accepted += 1;
                let emulator = emulator.clone();
                hosts.spawn(async move {
                    if let Err(err) = emulator.serve(stream).await {
                        warn!(error = %err, "host session failed");
                    }
                });
            }
            Some(_) = hosts.join_next(), if !hosts.is_empty() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                hosts.abort_all();
                break Ok(());
            }
        }
    };

    while hosts.join_next().await.is_some() {}
    let _ = std::fs::remove_file(&args.path);
    result.map(|()| SUCCESS)
}

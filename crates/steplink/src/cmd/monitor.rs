use crate::cmd::{close, connect, enable, interruptible, next, MonitorArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_packet, OutputFormat};

pub async fn run(args: MonitorArgs, format: OutputFormat) -> CliResult<i32> {
    let driver = connect(&args.device).await?;
    let mut packets = driver.subscribe();

    let result = interruptible(async {
        if !args.no_enable {
            enable(&driver).await?;
        }
        let mut seen = 0usize;
        while let Some(packet) = next(&mut packets).await {
            print_packet(&packet, format);
            seen += 1;
            if args.count.is_some_and(|count| seen >= count) {
                break;
            }
        }
        Ok(seen)
    })
    .await;
    close(&driver).await;

    let seen = result?;
    tracing::debug!(packets = seen, "monitor finished");
    Ok(SUCCESS)
}

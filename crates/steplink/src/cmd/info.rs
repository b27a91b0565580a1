use serde::Serialize;

use crate::cmd::{close, connect, enable, interruptible, InfoArgs};
use crate::exit::{driver_error, CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat};

#[derive(Serialize)]
struct InfoOutput {
    device: String,
    firmware: String,
    available_sequences: usize,
}

pub async fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let driver = connect(&args.device).await?;
    let result = interruptible(async {
        enable(&driver).await?;
        let firmware = driver
            .firmware_info()
            .await
            .map_err(|err| driver_error("FW_INFO failed", err))?;
        Ok(InfoOutput {
            device: driver.link().label(),
            firmware,
            available_sequences: driver.available_sequences(),
        })
    })
    .await;
    close(&driver).await;

    print_record(&result?, format);
    Ok(SUCCESS)
}

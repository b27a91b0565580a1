use serde::Serialize;
use steplink_motion::{Motor, MotorConfig};
use tracing::info;

use crate::cmd::{close, connect, enable, interruptible, parse_timeout, MoveArgs};
use crate::exit::{motion_error, CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat};

#[derive(Serialize)]
struct MoveOutput {
    motor: u8,
    target: f64,
    position: f64,
    steps: i64,
    unit: String,
}

pub async fn run(args: MoveArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.device.timeout)?;
    let mut config = match &args.config {
        Some(path) => MotorConfig::load(path).map_err(|err| motion_error("config", err))?,
        None => MotorConfig::default(),
    };
    config.active = true;

    let driver = connect(&args.device).await?;
    let motor = Motor::new(driver.clone(), args.motor, config);
    let _hooks = motor.attach();

    let result = interruptible(async {
        enable(&driver).await?;
        if !motor.is_enabled() {
            // The enabled hook logs its failure; surface the cause here.
            motor
                .enable(timeout)
                .await
                .map_err(|err| motion_error("motor enable failed", err))?;
        }
        if let Some(speed) = args.speed {
            motor
                .set_speed(speed)
                .map_err(|err| motion_error("speed", err))?;
        }
        info!(motor = motor.id(), target = args.target, "moving");
        motor.set_target(args.target);
        motor.idle().await;

        let config = motor.config();
        Ok(MoveOutput {
            motor: motor.id(),
            target: motor.target(),
            position: motor.position(),
            steps: motor.position_steps(),
            unit: config.unit,
        })
    })
    .await;
    close(&driver).await;

    print_record(&result?, format);
    Ok(SUCCESS)
}

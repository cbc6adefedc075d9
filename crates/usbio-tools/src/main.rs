//! usbio command line companions
//!
//! Small tools exercising the library against real hardware: `list` walks the
//! device tree, `watch` follows hotplug events until interrupted.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use usbio::{Context, Device, HotplugBuilder, HotplugEvent};

#[derive(Parser, Debug)]
#[command(name = "usbio-tools")]
#[command(author, version, about = "USB device inspection tools built on usbio")]
struct Args {
    /// Log filter (e.g. "debug", "usbio=trace")
    #[arg(short, long, value_name = "FILTER", default_value = "warn")]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected devices
    List {
        /// Also walk configurations, interfaces and endpoints
        #[arg(short, long)]
        verbose: bool,
    },
    /// Watch hotplug events until interrupted
    Watch {
        /// Only report devices with this vendor id (hex)
        #[arg(long, value_parser = parse_hex_u16)]
        vendor: Option<u16>,

        /// Only report devices with this product id (hex)
        #[arg(long, value_parser = parse_hex_u16)]
        product: Option<u16>,

        /// Report the matching devices already present at startup
        #[arg(long)]
        enumerate: bool,
    },
}

fn parse_hex_u16(value: &str) -> std::result::Result<u16, String> {
    u16::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| format!("not a hex id: {}", e))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let context = Context::new().context("cannot open libusb context")?;

    match args.command {
        Command::List { verbose } => list_devices(&context, verbose),
        Command::Watch {
            vendor,
            product,
            enumerate,
        } => watch_hotplug(&context, vendor, product, enumerate),
    }
}

fn device_line(device: &Device) -> String {
    let descriptor = device.device_descriptor();
    format!(
        "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
        device.bus_number(),
        device.address(),
        descriptor.vendor_id(),
        descriptor.product_id()
    )
}

fn list_devices(context: &Context, verbose: bool) -> Result<()> {
    for device in context.devices()? {
        println!("{}", device_line(&device));

        // String descriptors need an open handle; devices we may not open
        // are still listed by their ids.
        if let Ok(handle) = device.open() {
            let descriptor = device.device_descriptor();
            for (label, index) in [
                ("manufacturer", descriptor.manufacturer_string_index()),
                ("product", descriptor.product_string_index()),
                ("serial", descriptor.serial_number_string_index()),
            ] {
                if let Some(index) = index
                    && let Ok(text) = handle.read_string_descriptor_ascii(index)
                {
                    println!("  {}: {}", label, text);
                }
            }
        } else {
            debug!("cannot open {}, listing ids only", device_line(&device));
        }

        if verbose {
            print_configurations(&device);
        }
    }
    Ok(())
}

fn print_configurations(device: &Device) {
    let descriptor = device.device_descriptor();
    for index in 0..descriptor.num_configurations() {
        let Ok(config) = device.config_descriptor(index) else {
            println!("  configuration {}: <unreadable>", index);
            continue;
        };
        println!("  configuration value {}", config.value());
        for interface in config.interfaces() {
            for setting in interface.alt_settings() {
                println!(
                    "    interface {} alt {} class {:02x}:{:02x}:{:02x}",
                    setting.number(),
                    setting.alternate_setting(),
                    setting.class_code(),
                    setting.sub_class_code(),
                    setting.protocol_code()
                );
                for endpoint in setting.endpoints() {
                    println!(
                        "      endpoint {:#04x} {:?} {:?} max packet {}",
                        endpoint.address(),
                        endpoint.direction(),
                        endpoint.transfer_kind(),
                        endpoint.max_packet_size()
                    );
                }
            }
        }
    }
}

fn watch_hotplug(
    context: &Context,
    vendor: Option<u16>,
    product: Option<u16>,
    enumerate: bool,
) -> Result<()> {
    if !usbio::has_capability(usbio::Capability::HasHotplug) {
        anyhow::bail!("hotplug is not supported on this platform");
    }

    let mut builder = HotplugBuilder::new().enumerate(enumerate);
    if let Some(vendor) = vendor {
        builder = builder.vendor_id(vendor);
    }
    if let Some(product) = product {
        builder = builder.product_id(product);
    }

    let registration = builder.register(
        context,
        Box::new(|_, device, event| {
            let tag = match event {
                HotplugEvent::Arrived => "arrived",
                HotplugEvent::Left => "left",
            };
            println!("{:>8}  {}", tag, device_line(&device));
            false
        }),
    )?;
    println!("watching for hotplug events, press Ctrl-C to stop");

    loop {
        // Hotplug callbacks are dispatched from inside this call.
        match context.handle_events_timeout(Duration::from_secs(60)) {
            Ok(()) => {}
            Err(usbio::Error::Interrupted) => debug!("event handling interrupted"),
            Err(e) => {
                context.deregister_hotplug_callback(registration);
                return Err(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u16() {
        assert_eq!(parse_hex_u16("0x1d50"), Ok(0x1d50));
        assert_eq!(parse_hex_u16("6018"), Ok(0x6018));
        assert!(parse_hex_u16("zz").is_err());
    }
}

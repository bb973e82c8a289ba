use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SupportedStreamConfig, SupportedStreamConfigRange};

/// Print default and available audio devices with their stream configs.
pub fn print_devices() {
    let host = cpal::default_host();
    println!("Audio host: {:?}", host.id());

    println!("\nDefault input device (microphone):");
    match host.default_input_device() {
        Some(device) => {
            print_device(&device, device.default_input_config().ok());
            if let Ok(configs) = device.supported_input_configs() {
                print_ranges(configs);
            }
        }
        None => println!("  none"),
    }

    println!("\nDefault output device (speaker):");
    match host.default_output_device() {
        Some(device) => {
            print_device(&device, device.default_output_config().ok());
            if let Ok(configs) = device.supported_output_configs() {
                print_ranges(configs);
            }
        }
        None => println!("  none"),
    }

    println!("\nAll input devices:");
    if let Ok(devices) = host.input_devices() {
        for device in devices {
            print_device(&device, device.default_input_config().ok());
        }
    }

    println!("\nAll output devices:");
    if let Ok(devices) = host.output_devices() {
        for device in devices {
            print_device(&device, device.default_output_config().ok());
        }
    }
}

fn print_device(device: &Device, default: Option<SupportedStreamConfig>) {
    let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
    match default {
        Some(config) => println!(
            "  {} ({:?}, {} ch @ {} Hz)",
            name,
            config.sample_format(),
            config.channels(),
            config.sample_rate().0
        ),
        None => println!("  {}", name),
    }
}

fn print_ranges(configs: impl Iterator<Item = SupportedStreamConfigRange>) {
    println!("  Supported configs:");
    for config in configs {
        println!(
            "    Format: {:?}, channels: {}, rate: {}-{}",
            config.sample_format(),
            config.channels(),
            config.min_sample_rate().0,
            config.max_sample_rate().0
        );
    }
}

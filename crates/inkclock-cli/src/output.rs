//! Output formatting for CLI responses

use anyhow::Error;
use colored::*;
use inkclock_firmware_update::prelude::*;
use serde::Serialize;
use serde_json::json;

/// Print error in JSON format, on stderr so stdout keeps a single document
pub fn print_error_json(error: &Error) {
    let error_json = json!({
        "success": false,
        "error": {
            "message": error.to_string(),
        }
    });
    match serde_json::to_string_pretty(&error_json) {
        Ok(s) => eprintln!("{s}"),
        Err(e) => eprintln!("Failed to format error as JSON: {e}"),
    }
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), err);
        source = err.source();
    }
}

/// Pretty-print any serializable value
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to format output as JSON: {e}"),
    }
}

/// Print the outcome of an update attempt
pub fn print_update_result(result: &UpdateResult, json: bool) {
    if json {
        print_json(&json!({ "success": result.is_success(), "result": result }));
        return;
    }

    let headline = if result.is_success() {
        "Update installed".green().bold()
    } else {
        format!("Update {}", result.status).red().bold()
    };
    println!("{headline}");
    println!("  {} {}", "Message:".bold(), result.message);
    if let Some(kind) = result.error {
        println!("  {} {kind} (code {})", "Error:".bold(), kind.code());
    }
    if let (Some(before), Some(after)) = (result.previous_partition, result.active_partition) {
        println!("  {} {before} -> {after}", "Partition:".bold());
    }
    if result.download_attempts > 0 {
        println!("  {} {}", "Downloads:".bold(), result.download_attempts);
    }
    println!(
        "  {} {} bytes in {} ms",
        "Written:".bold(),
        result.bytes_written,
        result.duration.as_millis()
    );
}

/// Print a status event as it happens
pub fn print_status_event(event: &StatusEvent) {
    match event.error {
        Some(kind) => eprintln!(
            "{} [{:>3}%] {} ({kind})",
            event.status.to_string().yellow(),
            event.progress,
            event.message
        ),
        None => eprintln!(
            "{} [{:>3}%] {}",
            event.status.to_string().cyan(),
            event.progress,
            event.message
        ),
    }
}

/// Print device partition and probation state
pub fn print_device_status(status: &DeviceStatus, json: bool) {
    if json {
        print_json(&json!({ "success": true, "status": status }));
        return;
    }

    println!("{}", "Device Status".bold());
    println!("  {} {}", "Active:".bold(), status.active.to_string().green());
    println!("  {} {}", "Staging:".bold(), status.staging);
    if status.on_probation {
        println!(
            "  {} on probation, {} boot(s) counted",
            "Firmware:".bold(),
            status.boot_attempts
        );
    } else {
        println!("  {} validated", "Firmware:".bold());
    }
    if let Some(digest) = &status.image_sha256 {
        println!("  {} {}", "Image:".bold(), digest.dimmed());
    }
    println!(
        "  {} {}",
        "Snapshot:".bold(),
        if status.snapshot_present { "present" } else { "none" }
    );
    println!("  {} {}", "Sequence:".bold(), status.sequence);
}

/// Print a one-line success message, or a JSON object with `fields`
pub fn print_success(message: &str, fields: serde_json::Value, json: bool) {
    if json {
        let mut output = json!({ "success": true, "message": message });
        if let (Some(obj), serde_json::Value::Object(extra)) = (output.as_object_mut(), fields) {
            obj.extend(extra);
        }
        print_json(&output);
    } else {
        println!("{} {message}", "✓".green());
    }
}

//! Definition tooling: `jobflow validate` and `jobflow schema`.

use std::path::PathBuf;

use anyhow::{Result, bail};
use console::style;

use jobflow_core::workflow::definition::{definition_schema, load_workflow_file};

/// Validate each file, reporting every result before failing.
pub fn validate(files: &[PathBuf], json: bool) -> Result<()> {
    let mut reports = Vec::with_capacity(files.len());
    let mut invalid = 0;

    for file in files {
        match load_workflow_file(file) {
            Ok(def) => reports.push(serde_json::json!({
                "file": file.display().to_string(),
                "valid": true,
                "name": def.name,
                "version": def.version,
                "steps": def.steps.len(),
            })),
            Err(e) => {
                invalid += 1;
                reports.push(serde_json::json!({
                    "file": file.display().to_string(),
                    "valid": false,
                    "error": e.to_string(),
                }));
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!();
        for report in &reports {
            let file = report["file"].as_str().unwrap_or_default();
            if report["valid"] == true {
                println!(
                    "  {} {} ({} v{}, {} steps)",
                    style("✓").green(),
                    file,
                    style(report["name"].as_str().unwrap_or_default()).cyan(),
                    report["version"].as_str().unwrap_or_default(),
                    report["steps"]
                );
            } else {
                println!("  {} {}", style("✗").red(), file);
                println!(
                    "    {}",
                    style(report["error"].as_str().unwrap_or_default()).dim()
                );
            }
        }
        println!();
    }

    if invalid > 0 {
        bail!("{invalid} of {} definition(s) invalid", files.len());
    }
    Ok(())
}

/// Print the definition JSON Schema.
pub fn schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&definition_schema())?);
    Ok(())
}

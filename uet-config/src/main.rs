//! Operator CLI for the configuration file. Key material is resolved the same
//! way the server resolves it (UET_MASTER_KEY, then UET_KEY_FILE).

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use serde_json::json;
use uet_config::store::rewrite_file;
use uet_config::{logging, ConfigStore, Settings};

fn print_usage() {
    eprintln!("Commands:\n  encrypt [path]\n  decrypt [path]\n  check [path]\n  encrypt-value <plaintext>\n  decrypt-value <envelope>\n\nEnvironment:\n  UET_CONFIG_PATH  config file used when [path] is omitted\n  UET_MASTER_KEY   master key override\n  UET_KEY_FILE     key file (default .uet_key, created on first use)");
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let settings = Settings::from_env();
    logging::init(&settings.log_filter);

    if args.len() < 2 {
        print_usage();
        return ExitCode::FAILURE;
    }
    let path = |index: usize| {
        args.get(index)
            .map(PathBuf::from)
            .unwrap_or_else(|| settings.config_path.clone())
    };

    let outcome = match args[1].as_str() {
        "encrypt" | "decrypt" if args.len() <= 3 => {
            let encrypt = args[1] == "encrypt";
            let path = path(2);
            settings
                .keys
                .build_cipher()
                .map_err(|e| format!("key setup failed: {e}"))
                .and_then(|cipher| {
                    rewrite_file(&path, &cipher, encrypt).map_err(|e| format!("{}: {e}", args[1]))
                })
                .map(|fields| {
                    let verb = if encrypt { "encrypted" } else { "decrypted" };
                    println!("{verb} {fields} field(s) in {}", path.display());
                })
        }
        "check" if args.len() <= 3 => {
            let path = path(2);
            ConfigStore::load(&path, settings.keys.clone())
                .map_err(|e| format!("config load failed: {e}"))
                .and_then(|store| {
                    let document = store.snapshot();
                    let applications: Vec<_> = document
                        .applications
                        .iter()
                        .map(|app| {
                            json!({
                                "id": app.id,
                                "name": app.name,
                                "type": app.application_type().as_str(),
                                "enabled": app.enabled,
                                "tenantId": app.tenant_id,
                                "clientSecret": "<redacted in output>",
                            })
                        })
                        .collect();
                    let printable = json!({
                        "path": path.display().to_string(),
                        "encryptionEnabled": document.encryption_enabled,
                        "configured": store.is_configured(),
                        "tenants": document.tenants.iter().map(|t| json!({
                            "id": t.id,
                            "name": t.name,
                            "apiHostname": t.api_hostname,
                        })).collect::<Vec<_>>(),
                        "applications": applications,
                    });
                    serde_json::to_string_pretty(&printable)
                        .map(|text| println!("{text}"))
                        .map_err(|e| format!("render failed: {e}"))
                })
        }
        "encrypt-value" if args.len() == 3 => settings
            .keys
            .build_cipher()
            .and_then(|cipher| cipher.encrypt(&args[2]))
            .map(|envelope| println!("{envelope}"))
            .map_err(|e| format!("encryption failed: {e}")),
        "decrypt-value" if args.len() == 3 => settings
            .keys
            .build_cipher()
            .and_then(|cipher| cipher.decrypt(&args[2]))
            .map(|plaintext| println!("{plaintext}"))
            .map_err(|e| format!("decryption failed: {e}")),
        _ => {
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

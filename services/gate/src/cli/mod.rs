//! gate CLI 分发：`run`、`keygen`、`doctor`、`version`。

use anyhow::anyhow;
use rand::{RngCore, rngs::OsRng};
use serde_json::json;

use crate::config::{CIPHER_KEY_ENV, GateConfig, SIGNING_SECRET_ENV};

/// CLI 分发结果。
pub(crate) enum CliDispatch {
    /// 继续进入 gate 主循环。
    Run,
    /// 命令已处理完成，主程序应退出。
    Exit,
}

/// 解析并执行 gate CLI。
pub(crate) fn dispatch(args: &[String]) -> anyhow::Result<CliDispatch> {
    let Some(cmd) = args.first().map(|raw| raw.trim()) else {
        return Ok(CliDispatch::Run);
    };
    if cmd.is_empty() || cmd == "run" {
        return Ok(CliDispatch::Run);
    }

    if matches!(cmd, "-h" | "--help" | "help") {
        print_root_help();
        return Ok(CliDispatch::Exit);
    }

    match cmd {
        "keygen" => {
            let keys = generate_keys();
            println!("{CIPHER_KEY_ENV}={}", keys.cipher_key_hex);
            println!("{SIGNING_SECRET_ENV}={}", keys.signing_secret);
            Ok(CliDispatch::Exit)
        }
        "doctor" => {
            let format = parse_doctor_format(&args[1..])?;
            run_doctor(format);
            Ok(CliDispatch::Exit)
        }
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(CliDispatch::Exit)
        }
        other => Err(anyhow!(
            "unknown command: {other}; run `cl-gate --help` for usage"
        )),
    }
}

/// 新生成的一组密钥。
struct GeneratedKeys {
    cipher_key_hex: String,
    signing_secret: String,
}

fn generate_keys() -> GeneratedKeys {
    let mut cipher_key = [0u8; 32];
    OsRng.fill_bytes(&mut cipher_key);
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    GeneratedKeys {
        cipher_key_hex: hex::encode(cipher_key),
        signing_secret: hex::encode(secret),
    }
}

/// `doctor` 输出格式。
#[derive(Debug, PartialEq, Eq)]
enum DoctorFormat {
    Text,
    Json,
}

/// 解析 doctor 的 `--format` 参数。
fn parse_doctor_format(args: &[String]) -> anyhow::Result<DoctorFormat> {
    if args.is_empty() {
        return Ok(DoctorFormat::Text);
    }
    if args.len() == 2 && args[0] == "--format" {
        return match args[1].as_str() {
            "text" => Ok(DoctorFormat::Text),
            "json" => Ok(DoctorFormat::Json),
            other => Err(anyhow!("unsupported doctor format: {other}")),
        };
    }
    Err(anyhow!("usage: cl-gate doctor [--format text|json]"))
}

/// 校验环境配置并打印摘要；配置非法时以非零码退出。
fn run_doctor(format: DoctorFormat) {
    let loaded = GateConfig::from_env();
    let error = loaded.as_ref().err().map(|err| format!("{err:#}"));

    match (format, &loaded) {
        (DoctorFormat::Text, Ok(config)) => {
            println!("config: ok");
            println!("gate-addr: {}", config.listen_addr);
            println!("public-base-url: {}", config.public_base_url);
            println!("link-ttl-sec: {}", config.link_ttl_sec);
            println!("max-uses: {}", config.default_max_uses);
            println!(
                "allow-signature-mismatch: {}",
                if config.allow_signature_mismatch { "yes (debug only)" } else { "no" }
            );
        }
        (DoctorFormat::Text, Err(_)) => {
            println!("config: invalid");
            println!("error: {}", error.as_deref().unwrap_or_default());
        }
        (DoctorFormat::Json, Ok(config)) => {
            let payload = json!({
                "configOk": true,
                "gateAddr": config.listen_addr,
                "publicBaseUrl": config.public_base_url,
                "linkTtlSec": config.link_ttl_sec,
                "maxUses": config.default_max_uses,
                "allowSignatureMismatch": config.allow_signature_mismatch,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string())
            );
        }
        (DoctorFormat::Json, Err(_)) => {
            let payload = json!({ "configOk": false, "error": error });
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string())
            );
        }
    }

    if loaded.is_err() {
        std::process::exit(1);
    }
}

/// 打印 root help。
fn print_root_help() {
    println!("cl-gate usage:");
    println!("  cl-gate run");
    println!("  cl-gate keygen");
    println!("  cl-gate doctor [--format text|json]");
    println!("  cl-gate version");
}

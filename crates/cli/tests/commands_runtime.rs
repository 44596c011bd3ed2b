use std::env;
use std::sync::{Mutex, OnceLock};

use leadflow_cli::commands::process::ProcessArgs;
use leadflow_cli::commands::{config, doctor, migrate, process};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("LEADFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_unknown_provider() {
    with_env(&[("LEADFLOW_LLM_PROVIDER", "watson")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn config_redacts_the_api_key_and_names_env_sources() {
    with_env(
        &[
            ("LEADFLOW_LLM_PROVIDER", "openai"),
            ("LEADFLOW_LLM_API_KEY", "sk-super-secret"),
            ("LEADFLOW_LLM_MODEL", "gpt-4o-mini"),
        ],
        || {
            let output = config::run();

            assert!(!output.contains("sk-super-secret"));
            assert!(output.contains("- llm.api_key = <redacted> (source: env (LEADFLOW_LLM_API_KEY))"));
            assert!(output.contains("- llm.model = gpt-4o-mini (source: env (LEADFLOW_LLM_MODEL))"));
            assert!(output.contains("- orchestrator.execution_timeout_ms = 60000 (source: default)"));
        },
    );
}

#[test]
fn doctor_reports_every_check_as_json() {
    with_env(&[("LEADFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let payload = parse_payload(&doctor::run(true));

        assert_eq!(payload["overall_status"], "pass");
        let names: Vec<&str> = payload["checks"]
            .as_array()
            .expect("checks")
            .iter()
            .filter_map(|check| check["name"].as_str())
            .collect();
        assert_eq!(names, vec!["config_validation", "completion_provider", "database_connectivity"]);
    });
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_env(&[("LEADFLOW_LOGGING_LEVEL", "chatty")], || {
        let payload = parse_payload(&doctor::run(true));

        assert_eq!(payload["overall_status"], "fail");
        assert_eq!(payload["checks"][0]["status"], "fail");
        assert_eq!(payload["checks"][1]["status"], "skipped");
        assert_eq!(payload["checks"][2]["status"], "skipped");
    });
}

#[test]
fn process_runs_a_lead_against_an_ollama_compatible_server() {
    let server_runtime = tokio::runtime::Runtime::new().expect("runtime");
    let server = server_runtime.block_on(async {
        let server = MockServer::start().await;
        let answer = json!({
            "next_agent": "Qualifier",
            "qualificado": true,
            "area_juridica": "trabalhista",
            "viavel": true,
            "honorarios": 3500,
            "mensagem": "Olá Joana, segue nossa proposta."
        });
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": { "role": "assistant", "content": answer.to_string() },
                "prompt_eval_count": 10,
                "eval_count": 5
            })))
            .mount(&server)
            .await;
        server
    });
    let base_url = server.uri();

    with_env(
        &[
            ("LEADFLOW_DATABASE_URL", "sqlite::memory:"),
            ("LEADFLOW_DATABASE_MAX_CONNECTIONS", "1"),
            ("LEADFLOW_LLM_BASE_URL", base_url.as_str()),
        ],
        || {
            let result = process::run(ProcessArgs {
                message: "Fui demitido sem justa causa".to_string(),
                name: Some("Joana".to_string()),
                channel: "whatsapp".to_string(),
                timeout_ms: Some(10_000),
                ..ProcessArgs::default()
            });
            assert_eq!(result.exit_code, 0, "{}", result.output);

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "completed");
            assert_eq!(payload["stages"].as_array().expect("stages").len(), 4);
            assert_eq!(payload["qualification_result"]["area_juridica"], "trabalhista");
            assert_eq!(payload["message_sent"]["canal"], "whatsapp");
            assert_eq!(payload["total_tokens"], 60);
        },
    );
}

#[test]
fn process_reports_a_failed_run_when_the_provider_is_down() {
    with_env(
        &[
            ("LEADFLOW_DATABASE_URL", "sqlite::memory:"),
            ("LEADFLOW_DATABASE_MAX_CONNECTIONS", "1"),
            ("LEADFLOW_LLM_BASE_URL", "http://127.0.0.1:1"),
            ("LEADFLOW_LLM_MAX_RETRIES", "1"),
        ],
        || {
            let result = process::run(ProcessArgs {
                message: "Fui demitido sem justa causa".to_string(),
                channel: "cli".to_string(),
                timeout_ms: Some(10_000),
                ..ProcessArgs::default()
            });
            assert_eq!(result.exit_code, 1, "{}", result.output);

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "failed");
            assert_eq!(payload["stages"][0]["stage_name"], "qualification");
            assert_eq!(payload["stages"][0]["success"], false);
        },
    );
}

#[test]
fn process_rejects_an_empty_message() {
    with_env(&[], || {
        let result = process::run(ProcessArgs { channel: "cli".to_string(), ..ProcessArgs::default() });
        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "invalid_input");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let keys = [
        "LEADFLOW_DATABASE_URL",
        "LEADFLOW_DATABASE_MAX_CONNECTIONS",
        "LEADFLOW_DATABASE_TIMEOUT_SECS",
        "LEADFLOW_LLM_PROVIDER",
        "LEADFLOW_LLM_API_KEY",
        "LEADFLOW_LLM_BASE_URL",
        "LEADFLOW_LLM_MODEL",
        "LEADFLOW_LLM_TIMEOUT_SECS",
        "LEADFLOW_LLM_MAX_RETRIES",
        "LEADFLOW_ORCHESTRATOR_EXECUTION_TIMEOUT_MS",
        "LEADFLOW_ORCHESTRATOR_RETRY_BASE_DELAY_MS",
        "LEADFLOW_MEMORY_ENABLED",
        "LEADFLOW_SERVER_BIND_ADDRESS",
        "LEADFLOW_SERVER_PORT",
        "LEADFLOW_LOGGING_LEVEL",
        "LEADFLOW_LOGGING_FORMAT",
        "LEADFLOW_LOG_LEVEL",
        "LEADFLOW_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}

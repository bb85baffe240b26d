use reqwest::StatusCode;

use crate::error::GenerationError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub fn responses_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/responses")
}

/// Calls the Responses API and returns the concatenated output text.
///
/// Timeouts and retryable HTTP statuses map to `ModelTimeout`; connection and
/// authentication failures map to `ModelUnavailable`.
pub async fn responses_text(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    model: &str,
    instructions: &str,
    input: &str,
    temperature: f32,
) -> Result<String, GenerationError> {
    let mut body = serde_json::json!({
        "model": model,
        "instructions": instructions,
        "input": input,
        "text": { "format": { "type": "text" } },
        "store": false,
    });

    // GPT-5 models reject sampling params like `temperature`.
    if !model.starts_with("gpt-5")
        && let Some(obj) = body.as_object_mut()
    {
        obj.insert("temperature".to_owned(), serde_json::json!(temperature));
    }

    let response = client
        .post(endpoint)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await
        .map_err(|err| classify_transport_error(endpoint, &err))?;

    let status = response.status();
    let raw = response
        .text()
        .await
        .map_err(|err| classify_transport_error(endpoint, &err))?;
    if !status.is_success() {
        let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
        return Err(classify_status(status, &message));
    }

    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| GenerationError::InvalidOutput(format!("parse OpenAI response: {err}")))?;
    extract_output_text(&value)
}

fn classify_transport_error(endpoint: &str, err: &reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::ModelTimeout(format!("POST {endpoint}: {err}"))
    } else {
        GenerationError::ModelUnavailable(format!("POST {endpoint}: {err}"))
    }
}

fn classify_status(status: StatusCode, message: &str) -> GenerationError {
    let message = format!("OpenAI API error ({status}): {message}");
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        GenerationError::ModelTimeout(message)
    } else {
        GenerationError::ModelUnavailable(message)
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

fn extract_output_text(value: &serde_json::Value) -> Result<String, GenerationError> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            GenerationError::InvalidOutput("missing `output` array in response".to_owned())
        })?;

    let text = output
        .iter()
        .filter(|item| item.get("type").and_then(|v| v.as_str()) == Some("message"))
        .filter_map(|item| item.get("content").and_then(|v| v.as_array()))
        .flatten()
        .filter(|part| part.get("type").and_then(|v| v.as_str()) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
        .collect::<String>();

    if text.trim().is_empty() {
        return Err(GenerationError::InvalidOutput(
            "OpenAI output text is empty".to_owned(),
        ));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_trims_trailing_slash() {
        assert_eq!(
            responses_endpoint("http://localhost:1234/v1/"),
            "http://localhost:1234/v1/responses"
        );
    }

    #[test]
    fn statuses_are_classified() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            GenerationError::ModelUnavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            GenerationError::ModelTimeout(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream"),
            GenerationError::ModelTimeout(_)
        ));
    }

    #[test]
    fn output_text_concatenates_message_parts() -> anyhow::Result<()> {
        let value = serde_json::json!({
            "output": [
                { "type": "reasoning", "summary": [] },
                { "type": "message", "content": [
                    { "type": "output_text", "text": "[{\"front\":" },
                    { "type": "output_text", "text": "\"Q\",\"back\":\"A\"}]" }
                ]}
            ]
        });
        assert_eq!(
            extract_output_text(&value)?,
            r#"[{"front":"Q","back":"A"}]"#
        );
        Ok(())
    }

    #[test]
    fn empty_output_is_invalid() {
        let value = serde_json::json!({ "output": [] });
        assert!(matches!(
            extract_output_text(&value),
            Err(GenerationError::InvalidOutput(_))
        ));
    }
}

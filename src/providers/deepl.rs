use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::json;

use super::retry::{http_error, transport_error};
use super::{ItemResult, ProviderFuture, ProviderRequest, TranslationProvider};
use crate::error::{ProviderError, ProviderErrorKind};

const PRO_BASE_URL: &str = "https://api.deepl.com";
const FREE_BASE_URL: &str = "https://api-free.deepl.com";
const QUOTA_EXCEEDED: u16 = 456;

#[derive(Debug, Clone)]
pub struct DeepL {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl DeepL {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url.filter(|url| !url.trim().is_empty());
        self
    }

    fn url(&self, secret: &str) -> String {
        let base = self.base_url.clone().unwrap_or_else(|| {
            if secret.trim_end().ends_with(":fx") {
                FREE_BASE_URL.to_string()
            } else {
                PRO_BASE_URL.to_string()
            }
        });
        format!("{}/v2/translate", base.trim_end_matches('/'))
    }
}

impl TranslationProvider for DeepL {
    fn id(&self) -> String {
        "deepl".to_string()
    }

    fn translate(&self, request: ProviderRequest) -> ProviderFuture {
        let provider = self.clone();
        async move { call_translate(provider, request).await }.boxed()
    }
}

async fn call_translate(
    provider: DeepL,
    request: ProviderRequest,
) -> Result<Vec<ItemResult>, ProviderError> {
    let mut body = json!({
        "text": request.texts,
        "target_lang": target_code(&request.target_lang),
        "preserve_formatting": true
    });
    if let Some(source) = source_code(&request.source_lang) {
        body["source_lang"] = json!(source);
    }

    let response = provider
        .client
        .post(provider.url(&request.secret))
        .header(
            "Authorization",
            format!("DeepL-Auth-Key {}", request.secret.trim()),
        )
        .json(&body)
        .send()
        .await
        .map_err(|err| transport_error("DeepL", err))?;

    let status = response.status();
    let headers = response.headers().clone();
    let text = response
        .text()
        .await
        .map_err(|err| transport_error("DeepL", err))?;
    if status.as_u16() == QUOTA_EXCEEDED {
        return Err(ProviderError::new(
            ProviderErrorKind::AuthError,
            "DeepL quota exceeded for this key",
        ));
    }
    if !status.is_success() {
        let detail = extract_deepl_error(&text);
        return Err(http_error("DeepL", status, &headers, &text, detail));
    }
    parse_translations(&text)
}

fn parse_translations(text: &str) -> Result<Vec<ItemResult>, ProviderError> {
    let payload: DeepLResponse = serde_json::from_str(text).map_err(|err| {
        ProviderError::new(
            ProviderErrorKind::Unknown,
            format!("failed to parse DeepL response JSON: {}", err),
        )
    })?;
    Ok(payload
        .translations
        .into_iter()
        .map(|translation| Ok(translation.text))
        .collect())
}

fn extract_deepl_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
    }

    serde_json::from_str::<ErrorBody>(body)
        .ok()?
        .message
        .filter(|message| !message.trim().is_empty())
}

fn target_code(lang: &str) -> String {
    match lang.trim().to_lowercase().as_str() {
        "trad_chinese" | "traditional chinese" | "zh-hant" | "zh-tw" => "ZH-HANT".to_string(),
        "simp_chinese" | "simplified chinese" | "chinese" | "zh" | "zh-hans" | "zh-cn" => {
            "ZH-HANS".to_string()
        }
        "english" | "en" | "en-us" => "EN-US".to_string(),
        "en-gb" => "EN-GB".to_string(),
        "japanese" | "ja" => "JA".to_string(),
        "korean" | "ko" => "KO".to_string(),
        "french" | "fr" => "FR".to_string(),
        "german" | "de" => "DE".to_string(),
        "spanish" | "es" => "ES".to_string(),
        "italian" | "it" => "IT".to_string(),
        "russian" | "ru" => "RU".to_string(),
        "portuguese" | "pt" | "pt-br" => "PT-BR".to_string(),
        "" => "EN-US".to_string(),
        other => other.to_uppercase(),
    }
}

fn source_code(lang: &str) -> Option<String> {
    let trimmed = lang.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
        return None;
    }
    let code = target_code(trimmed);
    let base = code.split('-').next().unwrap_or(&code).to_string();
    Some(base)
}

#[derive(Debug, Deserialize)]
struct DeepLResponse {
    #[serde(default)]
    translations: Vec<DeepLTranslation>,
}

#[derive(Debug, Deserialize)]
struct DeepLTranslation {
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_language_names_to_deepl_codes() {
        assert_eq!(target_code("trad_chinese"), "ZH-HANT");
        assert_eq!(target_code("english"), "EN-US");
        assert_eq!(target_code("French"), "FR");
        assert_eq!(target_code("nb"), "NB");
        assert_eq!(source_code("english").as_deref(), Some("EN"));
        assert_eq!(source_code("auto"), None);
    }

    #[test]
    fn free_keys_use_free_endpoint() {
        let provider = DeepL::new(reqwest::Client::new());
        assert_eq!(
            provider.url("abc:fx"),
            "https://api-free.deepl.com/v2/translate"
        );
        assert_eq!(provider.url("abc"), "https://api.deepl.com/v2/translate");
        let custom = provider.with_base_url(Some("http://localhost:9000/".to_string()));
        assert_eq!(custom.url("abc:fx"), "http://localhost:9000/v2/translate");
    }

    #[test]
    fn parses_translations_in_order() {
        let items = parse_translations(
            r#"{"translations": [{"detected_source_language": "EN", "text": "Bonjour"}, {"text": "Salut"}]}"#,
        )
        .unwrap();
        let texts = items.into_iter().map(|item| item.unwrap()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["Bonjour", "Salut"]);
    }
}

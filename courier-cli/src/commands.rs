use std::io::Write;
use std::path::Path;

use courier_client::{ApiClient, Credential, FormData, RequestSpec};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::cli::HttpMethod;
use crate::error::{AppError, Result};

pub struct RequestOptions {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub json: Option<String>,
    pub form: Vec<(String, String)>,
    pub files: Vec<(String, String)>,
}

pub struct CommandExecutor {
    client: ApiClient,
}

impl CommandExecutor {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub async fn request(&self, options: RequestOptions, blob: Option<&Path>) -> Result<()> {
        let spec = build_spec(options).await?;

        match blob {
            Some(target) => {
                let bytes = self.client.blob(spec).await?;
                tokio::fs::write(target, &bytes).await?;
                info!(bytes = bytes.len(), path = %target.display(), "Saved response body");
            }
            None => {
                let data: Value = self.client.send(spec).await?;
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
        }
        Ok(())
    }

    pub async fn stream(&self, options: RequestOptions, parse: bool) -> Result<()> {
        let spec = build_spec(options).await?;
        let mut stdout = std::io::stdout();

        if parse {
            let mut events = self.client.json_events::<Value>(spec).await?;
            while let Some(event) = events.next().await {
                let event = event?;
                writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
            }
        } else {
            let mut events = self.client.text_events(spec).await?;
            while let Some(event) = events.next().await {
                let event = event?;
                writeln!(stdout, "[{}] {}", event.event, event.data)?;
            }
        }
        debug!("Stream closed");
        Ok(())
    }

    pub async fn login(&self, path: &str, form: Vec<(String, String)>) -> Result<Credential> {
        if form.is_empty() {
            return Err(AppError::InvalidInput(
                "login needs at least one --form field".into(),
            ));
        }
        let form = form
            .into_iter()
            .fold(FormData::new(), |form, (name, value)| form.text(name, value));
        let credential = self.client.sign_in(RequestSpec::post(path).form(form)).await?;
        Ok(credential)
    }
}

async fn build_spec(options: RequestOptions) -> Result<RequestSpec> {
    let mut spec = RequestSpec::new(options.method.into(), options.path);
    for (key, value) in options.query {
        spec = spec.query(key, value);
    }

    if let Some(body) = options.json {
        let body: Value = serde_json::from_str(&body)
            .map_err(|e| AppError::InvalidInput(format!("--json is not valid JSON: {e}")))?;
        spec = spec.json(&body)?;
    } else if !options.form.is_empty() || !options.files.is_empty() {
        let mut form = FormData::new();
        for (name, value) in options.form {
            form = form.text(name, value);
        }
        for (name, path) in options.files {
            let bytes = tokio::fs::read(&path).await?;
            let file_name = Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.clone());
            form = form.file(name, file_name, bytes, None);
        }
        spec = spec.form(form);
    }
    Ok(spec)
}

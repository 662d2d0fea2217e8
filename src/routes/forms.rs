use std::collections::HashMap;

use axum::{body::Bytes, extract::Multipart, http::StatusCode};

use crate::error::{AppError, AppResult};

pub struct FilePart {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// A multipart form with at most one `file` part; every other part is read
/// as text. Repeated names keep all values in order.
#[derive(Default)]
pub struct UploadForm {
    pub file: Option<FilePart>,
    fields: HashMap<String, Vec<String>>,
}

impl UploadForm {
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|values| values.first())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn texts(&self, name: &str) -> Vec<String> {
        self.fields
            .get(name)
            .map(|values| {
                values
                    .iter()
                    .map(|value| value.trim())
                    .filter(|value| !value.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn require_file(&self) -> AppResult<&FilePart> {
        self.file
            .as_ref()
            .filter(|file| !file.bytes.is_empty())
            .ok_or_else(|| AppError::BadRequest("Sila pilih fail untuk dimuat naik.".to_string()))
    }
}

fn multipart_error(error: axum::extract::multipart::MultipartError) -> AppError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::PayloadTooLarge("Saiz fail melebihi had 5MB.".to_string());
    }
    AppError::BadRequest(format!("Borang tidak sah: {}", error.body_text()))
}

pub async fn read_form(mut multipart: Multipart) -> AppResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let content_type = field.content_type().map(ToOwned::to_owned);
            let bytes = field.bytes().await.map_err(multipart_error)?;
            form.file = Some(FilePart {
                content_type,
                bytes,
            });
        } else {
            let value = field.text().await.map_err(multipart_error)?;
            form.fields.entry(name).or_default().push(value);
        }
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::UploadForm;

    #[test]
    fn text_helpers_trim_and_skip_blanks() {
        let mut form = UploadForm::default();
        form.fields.insert(
            "checklist".to_string(),
            vec![" kunci ".to_string(), "".to_string(), "kad akses".to_string()],
        );
        form.fields.insert("reference".to_string(), vec!["  ".to_string()]);

        assert_eq!(form.texts("checklist"), vec!["kunci", "kad akses"]);
        assert_eq!(form.text("reference"), None);
        assert_eq!(form.text("checklist"), Some("kunci"));
        assert!(form.require_file().is_err());
    }
}

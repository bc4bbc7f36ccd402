//! User-facing message catalogue
//!
//! Every text the scheduler sends through the notifier is rendered here in the
//! recipient's language.

use crate::models::{FileFormat, Language};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Progress of a page download, `bar` from [`crate::storage::progress_bar`]
    Downloading { bar: String },
    DownloadFinished { format: FileFormat },
    DownloadError,
    StartConversion { title: String, format: FileFormat },
    ConversionAndSend,
    ConversionError,
    GenerateUrl,
    UrlSend { url: String },
    /// Sync of an existing library failed on credentials
    UpdateLibraryError,
    /// First library build failed on credentials
    BuildLibraryError,
}

impl Message {
    pub fn render(&self, language: Language) -> String {
        match language {
            Language::En => self.render_en(),
            Language::Ja => self.render_ja(),
        }
    }

    fn render_en(&self) -> String {
        match self {
            Message::Downloading { bar } => format!("Downloading book...\n{bar}"),
            Message::DownloadFinished { format } => format!(
                "Download finished. Converting to {}...",
                format.to_string().to_uppercase()
            ),
            Message::DownloadError => {
                "The book could not be downloaded. Please try again later.".to_string()
            }
            Message::StartConversion { title, format } => format!(
                "Converting {title} to {}...",
                format.to_string().to_uppercase()
            ),
            Message::ConversionAndSend => "Conversion finished, sending the file...".to_string(),
            Message::ConversionError => {
                "The book could not be converted. Please try again later.".to_string()
            }
            Message::GenerateUrl => {
                "The file is too big to send here, generating a download link...".to_string()
            }
            Message::UrlSend { url } => format!("Your book is ready: {url}"),
            Message::UpdateLibraryError => {
                "Your library could not be updated. Please check your credentials.".to_string()
            }
            Message::BuildLibraryError => {
                "Your library could not be built. Please check your credentials.".to_string()
            }
        }
    }

    fn render_ja(&self) -> String {
        match self {
            Message::Downloading { bar } => format!("ダウンロード中...\n{bar}"),
            Message::DownloadFinished { format } => format!(
                "ダウンロードが完了しました。{}に変換しています...",
                format.to_string().to_uppercase()
            ),
            Message::DownloadError => {
                "本をダウンロードできませんでした。後でもう一度お試しください。".to_string()
            }
            Message::StartConversion { title, format } => format!(
                "{title}を{}に変換しています...",
                format.to_string().to_uppercase()
            ),
            Message::ConversionAndSend => "変換が完了しました。ファイルを送信しています...".to_string(),
            Message::ConversionError => {
                "本を変換できませんでした。後でもう一度お試しください。".to_string()
            }
            Message::GenerateUrl => {
                "ファイルが大きすぎるため、ダウンロードリンクを生成しています...".to_string()
            }
            Message::UrlSend { url } => format!("本の準備ができました: {url}"),
            Message::UpdateLibraryError => {
                "ライブラリを更新できませんでした。ログイン情報を確認してください。".to_string()
            }
            Message::BuildLibraryError => {
                "ライブラリを作成できませんでした。ログイン情報を確認してください。".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_in_both_languages() {
        let message = Message::DownloadFinished {
            format: FileFormat::Epub,
        };
        assert!(message.render(Language::En).contains("EPUB"));
        assert!(message.render(Language::Ja).contains("EPUB"));
        assert_ne!(message.render(Language::En), message.render(Language::Ja));
    }

    #[test]
    fn credential_errors_mention_credentials() {
        assert!(
            Message::UpdateLibraryError
                .render(Language::En)
                .contains("credentials")
        );
        assert!(
            Message::BuildLibraryError
                .render(Language::En)
                .contains("credentials")
        );
    }

    #[test]
    fn url_is_embedded() {
        let text = Message::UrlSend {
            url: "https://files.example.com/ABC.pdf".into(),
        }
        .render(Language::En);
        assert!(text.ends_with("https://files.example.com/ABC.pdf"));
    }
}

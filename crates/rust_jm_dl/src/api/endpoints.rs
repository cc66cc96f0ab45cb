//! Contains the [`Endpoint`] enum.

use reqwest::Method;

use crate::api::request::HostKind;

/// ## Info about endpoints
///
/// "Endpoints" in this context are paths that aren't
/// valid until prefixed with one of the hosts of [`Endpoint::host_kind`].
///
/// * [`Endpoint::Album`] returns album info, including its chapter list
/// * [`Endpoint::Chapter`] returns a chapter's image file names
/// * [`Endpoint::ChapterViewTemplate`] returns the html reader, which embeds the scramble threshold
/// * [`Endpoint::Image`] is one raw image on the image cdn
/// * [`Endpoint::Search`] takes a keyword and returns one page of albums
/// * [`Endpoint::Login`] takes a form body and returns user info
/// * [`Endpoint::Blog`] returns an article and its related albums
///
/// Every api endpoint except [`Endpoint::ChapterViewTemplate`] answers with
/// `{"code": 200, "data": "<encrypted>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Album(u64),
    Chapter(u64),
    ChapterViewTemplate(u64),
    Image { chapter_id: u64, file: String },
    Search { query: String, page: u32 },
    Login,
    Blog(u64),
}

impl Endpoint {
    pub fn path(&self) -> String {
        match self {
            Self::Album(_) => "/album".into(),
            Self::Chapter(_) => "/chapter".into(),
            Self::ChapterViewTemplate(_) => "/chapter_view_template".into(),
            Self::Image { chapter_id, file } => format!("/media/photos/{chapter_id}/{file}"),
            Self::Search { .. } => "/search".into(),
            Self::Login => "/login".into(),
            Self::Blog(_) => "/blog".into(),
        }
    }

    pub fn query(&self) -> Vec<(String, String)> {
        let pair = |k: &str, v: String| (k.to_string(), v);

        match self {
            Self::Album(id) | Self::Chapter(id) | Self::Blog(id) => vec![pair("id", id.to_string())],
            Self::ChapterViewTemplate(id) => vec![
                pair("id", id.to_string()),
                pair("mode", "vertical".into()),
                pair("page", "0".into()),
                pair("app_img_shunt", "1".into()),
            ],
            Self::Search { query, page } => vec![
                pair("search_query", query.clone()),
                pair("page", page.to_string()),
            ],
            Self::Image { .. } | Self::Login => Vec::new(),
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Self::Image { .. } | Self::Blog(_) => Method::GET,
            _ => Method::POST,
        }
    }

    pub fn host_kind(&self) -> HostKind {
        match self {
            Self::Image { .. } => HostKind::Image,
            _ => HostKind::Api,
        }
    }

    /// Path and query as one string, for logs.
    pub fn as_string(&self) -> String {
        let query = self.query();
        if query.is_empty() {
            return self.path();
        }

        // `String` pairs always encode
        let encoded = serde_urlencoded::to_string(&query).unwrap_or_default();
        format!("{}?{encoded}", self.path())
    }
}

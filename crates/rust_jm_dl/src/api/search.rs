//! Keyword search over albums.

use crate::api::{
    client::ApiClient,
    endpoints::Endpoint,
    models::{SearchPage, SearchWire},
};
use crate::errors::Result;

use log::info;

impl ApiClient {
    /// Fetches one page (1-based) of albums matching `keyword`.
    pub async fn search(&self, keyword: &str, page: u32) -> Result<SearchPage> {
        info!("Searching for {keyword:?}, page {page}");

        let endpoint = Endpoint::Search {
            query: keyword.to_string(),
            page: page.max(1),
        };
        let wire: SearchWire = self.call_encrypted(endpoint, |o| o).await?;

        Ok(SearchPage::from(wire))
    }
}

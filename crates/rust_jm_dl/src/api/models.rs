//! Contains the wire schemas of api payloads and the records they map into.
//!
//! Wire structs mirror the decrypted JSON and are as lenient as the api
//! is inconsistent (ids as numbers or strings, lists as strings, ...).
//! Records are what the rest of the crate works with; every field is
//! mapped explicitly, and a payload without a name is a missing target.

use crate::deserializers::{
    deserialize_counter, deserialize_id, deserialize_lenient_string, deserialize_string_list,
    deserialize_unix_time_maybe,
};
use crate::errors::{JmError, Result, TargetKind};
use crate::scramble::derive_split_counts;

use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// The outer `{"code": 200, "data": "..."}` of every api response.
#[derive(Deserialize, Debug, Clone)]
pub struct Envelope {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, rename = "errorMsg")]
    pub error_msg: String,
}

/*
{
  "id": 350234,
  "name": "...",
  "images": [],
  "addtime": "1655827574",
  "description": "",
  "total_views": "92412",
  "likes": "1.2K",
  "series": [{ "id": "350234", "name": "", "sort": "1" }],
  "author": ["..."],
  "tags": ["..."],
  "works": [],
  "actors": [],
  "related_list": [{ "id": "123", "author": "...", "name": "...", "image": "" }]
}
*/

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct SeriesWire {
    #[serde(deserialize_with = "deserialize_id")]
    id: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    name: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    sort: String,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct BriefWire {
    #[serde(deserialize_with = "deserialize_id")]
    id: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    name: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    author: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    image: String,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct AlbumWire {
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_unix_time_maybe")]
    addtime: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    description: String,
    #[serde(default, deserialize_with = "deserialize_counter")]
    total_views: u64,
    #[serde(default, deserialize_with = "deserialize_counter")]
    likes: u64,
    #[serde(default)]
    series: Vec<SeriesWire>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    author: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    works: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    actors: Vec<String>,
    #[serde(default)]
    related_list: Vec<BriefWire>,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct ChapterWire {
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    series_id: String,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_unix_time_maybe")]
    addtime: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct BlogInfoWire {
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    content: String,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    tags: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct BlogRefWire {
    #[serde(deserialize_with = "deserialize_id")]
    id: u64,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    title: String,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct BlogWire {
    info: Option<BlogInfoWire>,
    #[serde(default)]
    related_comics: Vec<BriefWire>,
    #[serde(default)]
    related_blogs: Vec<BlogRefWire>,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct SearchWire {
    #[serde(default, deserialize_with = "deserialize_counter")]
    total: u64,
    #[serde(default)]
    content: Vec<BriefWire>,
}

/// Login response; only the fields worth showing are kept.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub uid: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub username: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub email: String,
    #[serde(default, deserialize_with = "deserialize_lenient_string")]
    pub level_name: String,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub level: u64,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub coin: u64,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub album_favorites: u64,
    #[serde(default, deserialize_with = "deserialize_counter")]
    pub album_favorites_max: u64,
}

/// An album as listed in search results and "related" sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumBrief {
    pub id: u64,
    pub name: String,
    pub author: String,
    pub image: String,
}

impl From<BriefWire> for AlbumBrief {
    fn from(w: BriefWire) -> Self {
        Self {
            id: w.id,
            name: w.name,
            author: w.author,
            image: w.image,
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub total: u64,
    pub items: Vec<AlbumBrief>,
}

impl From<SearchWire> for SearchPage {
    fn from(w: SearchWire) -> Self {
        Self {
            total: w.total,
            items: w.content.into_iter().map(AlbumBrief::from).collect(),
        }
    }
}

/// A chapter as listed by its album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRef {
    pub id: u64,
    pub name: String,
    /// 1-based position within the album
    pub sort: u32,
}

/// One image of a chapter: `file` is what the cdn serves (`00001.webp`),
/// `name` is the file stem that goes into the strip-count hash (`00001`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub file: String,
    pub name: String,
}

impl ImageRef {
    /// Whether `file` names a single entry of a directory, with no root,
    /// prefix or `..` in it.
    pub fn is_plain_name(file: &str) -> bool {
        let mut parts = Path::new(file).components();
        matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None))
    }

    pub fn new(file: &str) -> Self {
        let name = file.split('.').next().unwrap_or(file).to_string();

        Self {
            file: file.to_string(),
            name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChapterRecord {
    pub id: u64,
    pub name: String,
    /// Id of the album this chapter belongs to, when the api says so.
    pub album_id: Option<u64>,
    pub tags: Vec<String>,
    pub added: Option<DateTime<Utc>>,
    images: Vec<ImageRef>,
    split_counts: Option<Vec<u32>>,
}

impl ChapterRecord {
    pub fn images(&self) -> &[ImageRef] {
        &self.images
    }

    /// Strip counts by image index, once [`Self::apply_threshold`] ran.
    pub fn split_counts(&self) -> Option<&[u32]> {
        self.split_counts.as_deref()
    }

    /// Derives the strip count of every image from a freshly fetched threshold.
    ///
    /// The result always has one entry per image, in image order.
    pub fn apply_threshold(&mut self, threshold: u64) -> &[u32] {
        let names: Vec<&str> = self.images.iter().map(|i| i.name.as_str()).collect();
        let counts = derive_split_counts(self.id, threshold, &names);

        self.split_counts.insert(counts)
    }

    /// Builds a chapter from its wire payload; `requested_id` is the id that was asked for.
    pub(crate) fn from_wire(w: ChapterWire, requested_id: u64) -> Result<Self> {
        let name = w.name.filter(|n| !n.trim().is_empty()).ok_or(JmError::NotExist {
            kind: TargetKind::Chapter,
            id: requested_id.to_string(),
        })?;

        let album_id = w.series_id.trim().parse::<u64>().ok().filter(|&id| id != 0);
        let id = w.id.trim().parse().unwrap_or(requested_id);

        // names are joined onto the work directory as they are
        if let Some(bad) = w.images.iter().find(|f| !ImageRef::is_plain_name(f)) {
            return Err(JmError::InvalidImageName {
                chapter_id: id,
                name: bad.clone(),
            });
        }

        Ok(Self {
            id,
            name,
            album_id,
            tags: w.tags,
            added: w.addtime,
            images: w.images.iter().map(|f| ImageRef::new(f)).collect(),
            split_counts: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AlbumRecord {
    pub id: u64,
    pub name: String,
    pub chapter_refs: Vec<ChapterRef>,
    pub published: Option<DateTime<Utc>>,
    /// Newest `added` of the fetched chapters.
    pub updated: Option<DateTime<Utc>>,
    pub description: String,
    pub tags: Vec<String>,
    pub authors: Vec<String>,
    pub works: Vec<String>,
    pub characters: Vec<String>,
    pub related: Vec<AlbumBrief>,
    pub likes: u64,
    pub views: u64,
    chapters: Vec<ChapterRecord>,
}

impl AlbumRecord {
    /// Chapters fetched so far, in declared order.
    pub fn chapters(&self) -> &[ChapterRecord] {
        &self.chapters
    }

    pub fn chapters_mut(&mut self) -> &mut [ChapterRecord] {
        &mut self.chapters
    }

    pub fn push_chapter(&mut self, chapter: ChapterRecord) {
        if chapter.added > self.updated {
            self.updated = chapter.added;
        }
        self.chapters.push(chapter);
    }

    /// Pages across every fetched chapter.
    pub fn page_count(&self) -> usize {
        self.chapters.iter().map(|c| c.images().len()).sum()
    }

    /// Ids of the chapters to fetch. An album without a chapter list is
    /// its own single chapter.
    pub fn chapter_ids(&self) -> Vec<u64> {
        if self.chapter_refs.is_empty() {
            vec![self.id]
        } else {
            self.chapter_refs.iter().map(|c| c.id).collect()
        }
    }

    /// Builds an album from its wire payload; `requested_id` is the id that was asked for.
    pub(crate) fn from_wire(w: AlbumWire, requested_id: u64) -> Result<Self> {
        let name = w.name.filter(|n| !n.trim().is_empty()).ok_or(JmError::NotExist {
            kind: TargetKind::Album,
            id: requested_id.to_string(),
        })?;

        let chapter_refs = w
            .series
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                let fallback = u32::try_from(i + 1).unwrap_or(u32::MAX);
                let sort = s.sort.trim().parse().unwrap_or(fallback);
                let name = if s.name.trim().is_empty() {
                    format!("Chapter {sort}")
                } else {
                    s.name
                };

                ChapterRef { id: s.id, name, sort }
            })
            .collect();

        Ok(Self {
            id: w.id.trim().parse().unwrap_or(requested_id),
            name,
            chapter_refs,
            published: w.addtime,
            updated: None,
            description: w.description,
            tags: w.tags,
            authors: w.author,
            works: w.works,
            characters: w.actors,
            related: w.related_list.into_iter().map(AlbumBrief::from).collect(),
            likes: w.likes,
            views: w.total_views,
            chapters: Vec::new(),
        })
    }
}

/// What the metadata query shows about an album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumSummary {
    pub id: u64,
    pub name: String,
    pub chapter_count: usize,
    pub authors: Vec<String>,
    pub characters: Vec<String>,
    pub likes: u64,
    pub views: u64,
}

impl From<&AlbumRecord> for AlbumSummary {
    fn from(a: &AlbumRecord) -> Self {
        Self {
            id: a.id,
            name: a.name.clone(),
            chapter_count: a.chapter_refs.len().max(1),
            authors: a.authors.clone(),
            characters: a.characters.clone(),
            likes: a.likes,
            views: a.views,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlogRef {
    pub id: u64,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct BlogRecord {
    pub id: u64,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub related_albums: Vec<AlbumBrief>,
    pub related_blogs: Vec<BlogRef>,
}

impl BlogRecord {
    pub(crate) fn from_wire(w: BlogWire, requested_id: u64) -> Result<Self> {
        let not_exist = || JmError::NotExist {
            kind: TargetKind::Blog,
            id: requested_id.to_string(),
        };

        let info = w.info.ok_or_else(not_exist)?;
        let title = info.title.filter(|t| !t.trim().is_empty()).ok_or_else(not_exist)?;

        Ok(Self {
            id: info.id.trim().parse().unwrap_or(requested_id),
            title,
            content: info.content,
            tags: info.tags,
            related_albums: w.related_comics.into_iter().map(AlbumBrief::from).collect(),
            related_blogs: w
                .related_blogs
                .into_iter()
                .map(|b| BlogRef { id: b.id, title: b.title })
                .collect(),
        })
    }

    /// The article as plain text, with html line breaks turned into newlines.
    pub fn to_text(&self) -> String {
        let mut out = format!("{}\n\n", self.title);

        let body = self
            .content
            .replace("<br />", "\n")
            .replace("<br/>", "\n")
            .replace("<br>", "\n");
        out.push_str(body.trim());
        out.push('\n');

        if !self.tags.is_empty() {
            out.push_str(&format!("\nTags: {}\n", self.tags.join(", ")));
        }

        if !self.related_albums.is_empty() {
            out.push_str("\nRelated albums:\n");
            for a in &self.related_albums {
                out.push_str(&format!("- {} {}\n", a.id, a.name));
            }
        }

        if !self.related_blogs.is_empty() {
            out.push_str("\nRelated articles:\n");
            for b in &self.related_blogs {
                out.push_str(&format!("- {} {}\n", b.id, b.title));
            }
        }

        out
    }
}

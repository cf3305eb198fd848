use chrono::{NaiveDateTime, Utc};
use tracing::{debug, info};

use super::types::{self, clean, json_text, parse_time, Attachment, Comment, Liked, Page, Post};
use super::ApiClient;
use crate::db::{MediaRow, ObjectKind, ObjectRow, Store};
use crate::error::ApiError;
use crate::extractor::Flow;
use crate::pacing;
use crate::session::TokenSource;

const POST_FIELDS: &str = "id,caption,created_time,description,from,icon,link,message,message_tags,\
name,object_id,permalink_url,picture,place,properties,shares,source,status_type,story,to,type,\
updated_time,with_tags";
const ATTACHMENT_FIELDS: &str =
    "description,description_tags,media,target,title,type,url,attachments,subattachments";
const COMMENT_FIELDS: &str =
    "id,attachment,created_time,comment_count,from,like_count,message,message_tags,user_likes";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BulkCounters {
    pub pages: usize,
    pub posts_retrieved: usize,
    pub posts_stored: usize,
    pub comments_retrieved: usize,
    pub comments_stored: usize,
    pub media: usize,
    pub users: usize,
}

/// Walks liked pages, their recent posts, attachments and comment threads,
/// storing everything through the store's idempotent inserts.
pub struct BulkDownloader<'a, T: TokenSource> {
    client: ApiClient<T>,
    store: &'a Store,
    counters: BulkCounters,
}

impl<'a, T: TokenSource> BulkDownloader<'a, T> {
    pub fn new(client: ApiClient<T>, store: &'a Store) -> Self {
        Self {
            client,
            store,
            counters: BulkCounters::default(),
        }
    }

    pub async fn run(mut self) -> Result<BulkCounters, ApiError> {
        self.liked_pages().await?;
        for (page_id, name) in self.store.pages()? {
            pacing::check(self.client.cancel_token())?;
            info!(page = %name, id = %page_id, "downloading page posts");
            self.posts_from_page(&page_id).await?;
        }
        info!(counters = ?self.counters, "bulk download complete");
        Ok(self.counters)
    }

    async fn liked_pages(&mut self) -> Result<(), ApiError> {
        let url = self.client.endpoint("me/likes", None)?;
        let liked: Vec<Liked> = self.client.fetch_all(&url).await?;
        for like in liked {
            let mut row = ObjectRow::new(&like.id, ObjectKind::Page);
            row.name = clean(&like.name);
            row.api_type = Some("Page".into());
            row.status_type = Some("Page".into());
            if !like.extra.is_empty() {
                row.raw = Some(serde_json::Value::Object(like.extra).to_string());
            }
            if self.store.insert_object(&row)? {
                self.counters.pages += 1;
            }
        }
        info!(pages = self.counters.pages, "liked pages stored");
        Ok(())
    }

    async fn posts_from_page(&mut self, page_id: &str) -> Result<(), ApiError> {
        let max_posts = self.client.settings().max_posts;
        let mut url = self
            .client
            .endpoint(&format!("{page_id}/feed"), Some(POST_FIELDS))?;
        let mut count = 0;

        loop {
            let page: Page<Post> = self.client.get_page(&url).await?;
            for post in page.data.iter() {
                self.counters.posts_retrieved += 1;
                if self.store_post(page_id, post).await? == Flow::StopPage {
                    return Ok(());
                }
                count += 1;
                if count >= max_posts {
                    info!(page_id, count, "maximum number of posts reached");
                    return Ok(());
                }
            }
            match page.next() {
                Some(next) => url = next.to_string(),
                None => return Ok(()),
            }
        }
    }

    /// `StopPage` when the post is too old or already stored.
    async fn store_post(&mut self, page_id: &str, post: &Post) -> Result<Flow, ApiError> {
        let created = parse_time(&post.created_time).ok_or_else(|| {
            ApiError::Contract(format!("post {} has bad created_time {:?}", post.id, post.created_time))
        })?;
        let days_old = (Utc::now().naive_utc() - created).num_days();
        if days_old > self.client.settings().days_depth {
            info!(post = %post.id, days_old, "too old, stop this page");
            return Ok(Flow::StopPage);
        }

        let user_id = self.store_user(post.from.as_ref(), created)?;
        let mut row = ObjectRow::new(&post.id, ObjectKind::Post);
        row.parent_id = Some(page_id.to_string());
        row.page_id = Some(page_id.to_string());
        row.created = Some(created);
        row.modified = post.updated_time.as_deref().and_then(parse_time);
        row.permalink = post.permalink_url.clone();
        row.api_type = post.kind.clone();
        row.status_type = post.status_type.clone();
        row.name = clean(&post.name);
        row.caption = clean(&post.caption);
        row.description = clean(&post.description);
        row.story = clean(&post.story);
        row.message = clean(&post.message);
        row.user_id = user_id;
        row.shares = post.shares.as_ref().map(|s| s.count).unwrap_or(0);
        row.place = json_text(&post.place);
        row.tags = json_text(&post.message_tags);
        row.with_tags = json_text(&post.with_tags);
        row.properties = json_text(&post.properties);
        if !post.extra.is_empty() {
            row.raw = Some(serde_json::Value::Object(post.extra.clone()).to_string());
        }

        if !self.store.insert_object(&row)? {
            info!(post = %post.id, "post already stored, stop this page");
            return Ok(Flow::StopPage);
        }
        self.counters.posts_stored += 1;

        self.attachments(&post.id).await?;
        self.comments(&post.id, page_id).await?;
        Ok(Flow::Continue)
    }

    fn store_user(
        &mut self,
        from: Option<&types::UserRef>,
        at: NaiveDateTime,
    ) -> Result<Option<String>, ApiError> {
        let Some(user) = from else {
            return Ok(None);
        };
        if self.store.insert_user(&user.id, user.name.as_deref(), Some(at))? {
            self.counters.users += 1;
        } else {
            debug!(user = %user.id, "user already known");
        }
        Ok(Some(user.id.clone()))
    }

    async fn attachments(&mut self, post_id: &str) -> Result<(), ApiError> {
        let url = self
            .client
            .endpoint(&format!("{post_id}/attachments"), Some(ATTACHMENT_FIELDS))?;
        let page: Page<Attachment> = self.client.get_page(&url).await?;
        self.scan_attachments(&page.data, post_id)
    }

    /// Store one media row per attachment, descending into sub-attachments.
    fn scan_attachments(&mut self, list: &[Attachment], owner_id: &str) -> Result<(), ApiError> {
        for attachment in list {
            let image = attachment.image();
            let row = MediaRow {
                owner_id: owner_id.to_string(),
                kind: attachment.kind.clone(),
                title: clean(&attachment.title),
                description: clean(&attachment.description),
                tags: json_text(&attachment.description_tags),
                target: json_text(&attachment.target),
                media_json: json_text(&attachment.media),
                src: image.as_ref().map(|i| i.src.clone()),
                width: image.as_ref().and_then(|i| i.width),
                height: image.as_ref().and_then(|i| i.height),
            };
            self.store.insert_media(&row)?;
            self.counters.media += 1;

            if let Some(sub) = &attachment.subattachments {
                self.scan_attachments(&sub.data, owner_id)?;
            }
        }
        Ok(())
    }

    /// The whole comment tree of a post. Threads are walked with an explicit
    /// stack; replies are fetched for every comment that reports some.
    async fn comments(&mut self, post_id: &str, page_id: &str) -> Result<(), ApiError> {
        let mut stack = vec![post_id.to_string()];
        while let Some(parent) = stack.pop() {
            let mut url = self
                .client
                .endpoint(&format!("{parent}/comments"), Some(COMMENT_FIELDS))?;
            let mut stored = 0;
            loop {
                let page: Page<Comment> = self.client.get_page(&url).await?;
                for comment in &page.data {
                    self.counters.comments_retrieved += 1;
                    if self.store_comment(comment, &parent, post_id, page_id)? {
                        stored += 1;
                    }
                    if comment.comment_count > 0 {
                        stack.push(comment.id.clone());
                    }
                }
                match page.next() {
                    Some(next) => url = next.to_string(),
                    None => break,
                }
            }
            debug!(parent = %parent, stored, "comment block done");
        }
        Ok(())
    }

    fn store_comment(
        &mut self,
        comment: &Comment,
        parent: &str,
        post_id: &str,
        page_id: &str,
    ) -> Result<bool, ApiError> {
        let created = parse_time(&comment.created_time);
        let user_id = match created {
            Some(at) => self.store_user(comment.from.as_ref(), at)?,
            None => comment.from.as_ref().map(|u| u.id.clone()),
        };

        let mut row = ObjectRow::new(&comment.id, ObjectKind::Comment);
        row.parent_id = Some(parent.to_string());
        row.page_id = Some(page_id.to_string());
        row.post_id = Some(post_id.to_string());
        row.created = created;
        row.api_type = Some("Comment".into());
        row.message = clean(&comment.message);
        row.user_id = user_id;
        row.likes = comment.like_count;
        row.tags = json_text(&comment.message_tags);
        if !comment.extra.is_empty() {
            row.raw = Some(serde_json::Value::Object(comment.extra.clone()).to_string());
        }

        let inserted = self.store.insert_object(&row)?;
        if inserted {
            self.counters.comments_stored += 1;
            if let Some(attachment) = &comment.attachment {
                self.scan_attachments(std::slice::from_ref(attachment), &comment.id)?;
            }
        }
        Ok(inserted)
    }
}

// ── Tests ──

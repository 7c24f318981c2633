pub mod repost;

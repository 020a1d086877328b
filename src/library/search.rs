//! Fuzzy name search over the library tree.

use crate::library::file_tree::TreeNode;
use crate::library::favorites::Favorites;
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use std::cmp::Ordering;
use std::path::PathBuf;

/// Score bonus for favorite documents.
const FAVORITE_BOOST: i64 = 100;

/// Default number of results returned.
pub const MAX_RESULTS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub name: String,
    pub path: PathBuf,
    pub is_folder: bool,
    pub is_favorite: bool,
    /// Fuzzy match score, including the favorite boost
    pub score: i64,
}

/// Search folder and document names below `tree` (the root itself excluded).
///
/// An empty query lists the favorites. Results are ordered by score, then
/// folders before documents, then by name.
pub fn search(tree: &TreeNode, query: &str, favorites: &Favorites, limit: usize) -> Vec<SearchHit> {
    let query = query.trim();
    let matcher = SkimMatcherV2::default().ignore_case();
    let mut hits: Vec<SearchHit> = Vec::new();

    tree.walk(&mut |node| {
        if node.path == tree.path {
            return;
        }
        let is_favorite = node.is_document() && favorites.contains(&node.path);
        let score = if query.is_empty() {
            if !is_favorite {
                return;
            }
            0
        } else {
            match matcher.fuzzy_match(&node.name, query) {
                Some(score) if is_favorite => score + FAVORITE_BOOST,
                Some(score) => score,
                None => return,
            }
        };
        hits.push(SearchHit {
            name: node.name.clone(),
            path: node.path.clone(),
            is_folder: node.is_folder(),
            is_favorite,
            score,
        });
    });

    hits.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| match (a.is_folder, b.is_folder) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => Ordering::Equal,
            })
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    hits.truncate(limit);
    hits
}

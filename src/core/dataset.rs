use crate::core::models::movie::Movie;
use anyhow::{Context, Error};
use flate2::read::GzDecoder;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Load a json array of movies, gunzipping first if the path ends in `.gz`
pub fn load(path: &Path) -> Result<Vec<Movie>, Error> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    serde_json::from_reader(reader)
        .with_context(|| format!("failed to decode movies from {}", path.display()))
}

/// Newest release first, entries without a parsable date last
fn by_release_desc(a: &Movie, b: &Movie) -> Ordering {
    match (a.released(), b.released()) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// A sorted copy of `movies` holding only the titles containing `query`,
/// case insensitive. An empty query keeps everything
pub fn sort_and_filter(movies: &[Movie], query: Option<&str>) -> Vec<Movie> {
    let query = query.map(str::trim).filter(|q| !q.is_empty()).map(str::to_uppercase);

    let mut matched: Vec<Movie> = match &query {
        Some(q) => movies
            .iter()
            .filter(|m| m.title.to_uppercase().contains(q.as_str()))
            .cloned()
            .collect(),
        None => movies.to_vec(),
    };

    matched.sort_by(by_release_desc);
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn movie(title: &str, date: &str) -> Movie {
        Movie {
            title: title.to_string(),
            vote_average: 7.0,
            release_date: date.to_string(),
        }
    }

    fn sample() -> Vec<Movie> {
        vec![
            movie("Alien", "1979-05-25"),
            movie("Aliens", "1986-07-18"),
            movie("Unknown Alien Film", "someday"),
            movie("Heat", "1995-12-15"),
            movie("Alien: Romulus", "2024-08-16"),
        ]
    }

    #[test]
    fn test_sorts_newest_first_unparsable_last() {
        let sorted = sort_and_filter(&sample(), None);
        let titles: Vec<_> = sorted.iter().map(|m| m.title.as_str()).collect();

        assert_eq!(
            titles,
            vec!["Alien: Romulus", "Heat", "Aliens", "Alien", "Unknown Alien Film"]
        );
    }

    #[test]
    fn test_filter_is_case_insensitive_and_leaves_input_alone() {
        let movies = sample();
        let filtered = sort_and_filter(&movies, Some("aLiEn"));
        let titles: Vec<_> = filtered.iter().map(|m| m.title.as_str()).collect();

        assert_eq!(
            titles,
            vec!["Alien: Romulus", "Aliens", "Alien", "Unknown Alien Film"]
        );
        assert_eq!(movies, sample());
    }

    #[test]
    fn test_blank_query_keeps_all_and_no_match_is_empty() {
        assert_eq!(sort_and_filter(&sample(), Some("  ")).len(), 5);
        assert!(sort_and_filter(&sample(), Some("zzz")).is_empty());
        assert!(sort_and_filter(&[], Some("alien")).is_empty());
    }

    #[test]
    fn test_load_plain_and_gzipped() {
        let json = serde_json::to_vec(&sample()).unwrap();
        let dir = std::env::temp_dir();
        let id = fastrand::u64(..);

        let plain = dir.join(format!("movies-{}.json", id));
        std::fs::write(&plain, &json).unwrap();

        let gzipped = dir.join(format!("movies-{}.json.gz", id));
        let mut encoder = GzEncoder::new(File::create(&gzipped).unwrap(), Compression::default());
        encoder.write_all(&json).unwrap();
        encoder.finish().unwrap();

        assert_eq!(load(&plain).unwrap(), sample());
        assert_eq!(load(&gzipped).unwrap(), sample());

        std::fs::remove_file(plain).unwrap();
        std::fs::remove_file(gzipped).unwrap();
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to open"));
    }
}

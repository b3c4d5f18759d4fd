use std::collections::BTreeMap;

/// Transport headers allowed to reach connection hooks and action handlers.
pub const ALLOWED_PUBLIC_HEADERS: &[&str] = &[
	"content-type",
	"user-agent",
	"x-actor-query",
	"x-actor-encoding",
	"x-actor-conn-params",
	"x-actor",
	"x-actor-conn",
	"x-actor-conn-token",
];

/// Drop every header outside [`ALLOWED_PUBLIC_HEADERS`].
///
/// Names are compared case-insensitively and returned lowercased. When a
/// header repeats, the last value wins.
pub fn filter_public_headers<I, K, V>(headers: I) -> BTreeMap<String, String>
where
	I: IntoIterator<Item = (K, V)>,
	K: AsRef<str>,
	V: Into<String>,
{
	headers
		.into_iter()
		.filter_map(|(name, value)| {
			let name = name.as_ref().to_ascii_lowercase();
			ALLOWED_PUBLIC_HEADERS
				.contains(&name.as_str())
				.then(|| (name, value.into()))
		})
		.collect()
}

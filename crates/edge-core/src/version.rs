use std::fmt;
use std::fmt::{Display, Formatter};

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug)]
pub struct BuildInfo {
	pub version: &'static str,
	pub build_profile: &'static str,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: BUILD_VERSION,
			build_profile: if cfg!(debug_assertions) {
				"debug"
			} else {
				"release"
			},
		}
	}
}

impl Default for BuildInfo {
	fn default() -> Self {
		Self::new()
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{Version:\"{}\", BuildProfile:\"{}\"}}",
			self.version, self.build_profile
		)
	}
}


use std::fmt::{self, Write};
use std::borrow::Borrow;
use std::error::Error as StdError;

use anyhow::Context;

use ark::VtxoId;

pub trait AnyhowErrorExt: Borrow<anyhow::Error> {
	fn full_msg(&self) -> String {
		let mut ret = String::new();
		for (i, e) in self.borrow().chain().enumerate() {
			if i == 0 {
				write!(ret, "{}", e).expect("write to buf");
			} else {
				write!(ret, ": {}", e).expect("write to buf");
			}
		}
		ret
	}
}
impl AnyhowErrorExt for anyhow::Error {}

/// An error type to add context to anyhow to indicate any form
/// of incorrect user input.
pub struct BadArgument {
	context: Box<dyn fmt::Display + Send + Sync + 'static>,
}

impl BadArgument {
	pub fn new(context: impl fmt::Display + Send + Sync + 'static) -> BadArgument {
		BadArgument {
			context: Box::new(context),
		}
	}
}

impl fmt::Debug for BadArgument {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl fmt::Display for BadArgument {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "bad user input: {}", self.context)
	}
}

impl StdError for BadArgument {}

/// An error type to add context to anyhow to indicate that a referenced
/// entity doesn't exist.
pub struct NotFound {
	ids: Vec<String>,
	context: Box<dyn fmt::Display + Send + Sync + 'static>,
}

impl NotFound {
	pub fn new(
		ids: impl IntoIterator<Item = impl fmt::Display>,
		context: impl fmt::Display + Send + Sync + 'static,
	) -> NotFound {
		NotFound {
			ids: ids.into_iter().map(|i| i.to_string()).collect(),
			context: Box::new(context),
		}
	}

	pub fn identifiers(&self) -> &Vec<String> {
		&self.ids
	}
}

impl fmt::Debug for NotFound {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl fmt::Display for NotFound {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "not found: {}", self.context)
	}
}

impl StdError for NotFound {}

/// An input was already spent. Terminal for the offending request.
///
/// The id is the display form of the spent entity, a VTXO outpoint or a
/// note id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("already spent: {id}")]
pub struct AlreadySpent {
	pub id: String,
}

impl AlreadySpent {
	pub fn new(id: impl fmt::Display) -> AlreadySpent {
		AlreadySpent { id: id.to_string() }
	}
}

/// The referenced VTXO is part of the round currently being finalized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("vtxo {id} is part of a round in progress")]
pub struct RoundInProgress {
	pub id: VtxoId,
}

/// Return an [mod@anyhow] error tagged with [BadArgument].
macro_rules! badarg {
	($($arg:tt)*) => {
		Err(anyhow::Error::from($crate::error::BadArgument::new(format!($($arg)*))))
	};
}
pub(crate) use badarg;

/// Return an [mod@anyhow] error tagged with [NotFound].
macro_rules! not_found {
	($ids:expr, $($arg:tt)*) => {
		Err(anyhow::Error::from($crate::error::NotFound::new($ids, format!($($arg)*))))
	};
}
pub(crate) use not_found;

/// Extension trait for adding coordinator-specific error info.
pub trait ContextExt<T, E>: Context<T, E> {
	/// Tag an error with [BadArgument].
	fn badarg<C>(self, context: C) -> anyhow::Result<T>
		where C: fmt::Display + Send + Sync + 'static;

	/// Tag an error with [NotFound].
	fn not_found<I, V, C>(self, ids: V, context: C) -> anyhow::Result<T>
	where
		V: IntoIterator<Item = I>,
		I: fmt::Display,
		C: fmt::Display + Send + Sync + 'static;
}

impl<R, T, E> ContextExt<T, E> for R
where
	R: Context<T, E>,
{
	fn badarg<C>(self, context: C) -> anyhow::Result<T>
	where
		C: fmt::Display + Send + Sync + 'static,
	{
		self.context(BadArgument::new(context))
	}

	fn not_found<I, V, C>(self, ids: V, context: C) -> anyhow::Result<T>
	where
		V: IntoIterator<Item = I>,
		I: fmt::Display,
		C: fmt::Display + Send + Sync + 'static,
	{
		self.context(NotFound::new(ids, context))
	}
}

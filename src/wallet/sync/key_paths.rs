use crate::repository::Repository;
use crate::wallet::sync::utxo_state::ScriptMatcher;
use crate::wallet::{DerivationStrategy, ExplorerError};

use bitcoin::bip32::DerivationPath;
use bitcoin::{Script, ScriptBuf};
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Script to key path lookups for one strategy, memoized for the lifetime of one request.
///
/// Only scripts never seen by this resolver reach the repository, batched into a single call.
/// Unowned scripts are memoized too, as `None`.
pub struct KeyPathResolver {
	repository: Arc<dyn Repository>,
	strategy: DerivationStrategy,
	memo: HashMap<ScriptBuf, Option<DerivationPath>>,
}

impl KeyPathResolver {
	pub fn new(repository: Arc<dyn Repository>, strategy: DerivationStrategy) -> Self {
		Self {
			repository,
			strategy,
			memo: HashMap::new(),
		}
	}

	/// Key paths of `scripts`, in the same order. `None` where the strategy does not own the script.
	pub async fn resolve<'a, I>(&mut self, scripts: I) -> Result<Vec<Option<DerivationPath>>, ExplorerError>
	where
		I: IntoIterator<Item = &'a Script>,
	{
		let scripts: Vec<&Script> = scripts.into_iter().collect();
		let unseen: Vec<ScriptBuf> = scripts
			.iter()
			.filter(|script| !self.memo.contains_key(**script))
			.unique()
			.map(|script| ScriptBuf::from(*script))
			.collect();

		if !unseen.is_empty() {
			debug!("Resolving {} new scripts for {}", unseen.len(), self.strategy);
			let owners = self.repository.get_key_informations(&unseen).await?;
			for (script, candidates) in unseen.into_iter().zip(owners) {
				let key_path = candidates
					.into_iter()
					.find(|candidate| candidate.strategy == self.strategy)
					.map(|candidate| candidate.key_path);
				self.memo.insert(script, key_path);
			}
		}

		Ok(scripts
			.into_iter()
			.map(|script| self.lookup(script).cloned())
			.collect())
	}

	/// Memoized key path of `script`, without touching the repository.
	pub fn lookup(&self, script: &Script) -> Option<&DerivationPath> {
		self.memo.get(script).and_then(Option::as_ref)
	}
}

impl ScriptMatcher for KeyPathResolver {
	fn matches(&self, scripts: &[&Script]) -> Vec<bool> {
		scripts.iter().map(|script| self.lookup(script).is_some()).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_utils::{CountingRepository, key_info, script};
	use crate::wallet::DerivationFeature;
	use std::sync::atomic::Ordering;

	fn setup() -> (Arc<CountingRepository>, DerivationStrategy) {
		let repository = Arc::new(CountingRepository::default());
		let alice = DerivationStrategy::new("xpub-alice");
		let bob = DerivationStrategy::new("xpub-bob");
		repository.inner.add_key(key_info(&bob, DerivationFeature::Deposit, 0, script(1)));
		repository.inner.add_key(key_info(&alice, DerivationFeature::Deposit, 0, script(1)));
		repository.inner.add_key(key_info(&alice, DerivationFeature::Change, 3, script(2)));
		repository.inner.add_key(key_info(&bob, DerivationFeature::Deposit, 1, script(3)));
		(repository, alice)
	}

	#[tokio::test]
	async fn resolves_only_own_strategy_in_request_order() {
		let (repository, alice) = setup();
		let mut resolver = KeyPathResolver::new(repository.clone(), alice.clone());

		let (a, b, c) = (script(1), script(2), script(3));
		let paths = resolver
			.resolve([a.as_script(), c.as_script(), b.as_script(), a.as_script()])
			.await
			.unwrap();

		let expected_a = key_info(&alice, DerivationFeature::Deposit, 0, script(1)).key_path;
		let expected_b = key_info(&alice, DerivationFeature::Change, 3, script(2)).key_path;
		assert_eq!(paths, vec![Some(expected_a.clone()), None, Some(expected_b), Some(expected_a)]);
		assert_eq!(repository.key_calls(), 1);
		assert_eq!(repository.key_scripts.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn memoized_scripts_cost_no_further_calls() {
		let (repository, alice) = setup();
		let mut resolver = KeyPathResolver::new(repository.clone(), alice);

		let (a, c, unknown) = (script(1), script(3), script(42));
		resolver.resolve([a.as_script(), c.as_script()]).await.unwrap();
		resolver.resolve([c.as_script(), a.as_script()]).await.unwrap();
		assert_eq!(repository.key_calls(), 1);

		resolver.resolve([a.as_script(), unknown.as_script()]).await.unwrap();
		assert_eq!(repository.key_calls(), 2);
		assert_eq!(repository.key_scripts.load(Ordering::SeqCst), 3);

		assert_eq!(
			resolver.matches(&[a.as_script(), c.as_script(), unknown.as_script()]),
			vec![true, false, false]
		);
	}

	#[tokio::test]
	async fn separate_resolvers_do_not_share_memo() {
		let (repository, alice) = setup();
		let a = script(1);

		let mut first = KeyPathResolver::new(repository.clone(), alice.clone());
		first.resolve([a.as_script()]).await.unwrap();
		let mut second = KeyPathResolver::new(repository.clone(), alice);
		assert!(second.lookup(&a).is_none());
		second.resolve([a.as_script()]).await.unwrap();

		assert_eq!(repository.key_calls(), 2);
	}
}

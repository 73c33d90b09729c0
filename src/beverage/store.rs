use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::beverage::model::{
    Beverage, Ingredient, BASES_COLLECTION, BEVERAGES_COLLECTION, CREAMERS_COLLECTION, SYRUPS_COLLECTION,
};
use crate::firestore::client::FirestoreClient;
use crate::firestore::core::{FilterOperator, ListenOptions, ListenerId, Query, ViewSnapshot};
use crate::firestore::credentials::User;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, Mutation};
use crate::firestore::value::FirestoreValue;
use crate::util::subscribe::Observer;

pub const TEMPERATURES: [&str; 2] = ["Hot", "Cold"];
pub const NO_USER_MESSAGE: &str = "No user logged in, please sign in first.";

/// Everything the beverage app shows.
#[derive(Clone, Debug, PartialEq)]
pub struct BeverageState {
    pub temperatures: Vec<String>,
    pub current_temp: String,
    pub bases: Vec<Ingredient>,
    pub current_base: Option<Ingredient>,
    pub creamers: Vec<Ingredient>,
    pub current_creamer: Option<Ingredient>,
    pub syrups: Vec<Ingredient>,
    pub current_syrup: Option<Ingredient>,
    pub current_name: String,
    pub beverages: Vec<Beverage>,
    pub current_beverage: Option<Beverage>,
    pub message: String,
    pub user: Option<User>,
}

impl Default for BeverageState {
    fn default() -> Self {
        Self {
            temperatures: TEMPERATURES.iter().map(|temp| temp.to_string()).collect(),
            current_temp: TEMPERATURES[0].to_string(),
            bases: Vec::new(),
            current_base: None,
            creamers: Vec::new(),
            current_creamer: None,
            syrups: Vec::new(),
            current_syrup: None,
            current_name: String::new(),
            beverages: Vec::new(),
            current_beverage: None,
            message: String::new(),
            user: None,
        }
    }
}

impl BeverageState {
    fn signed_in_uid(&self) -> Option<String> {
        self.user.as_ref().and_then(User::uid).map(str::to_string)
    }

    fn upsert_beverage(&mut self, beverage: Beverage) {
        match self.beverages.iter_mut().find(|existing| existing.id == beverage.id) {
            Some(existing) => *existing = beverage,
            None => self.beverages.push(beverage),
        }
    }
}

struct StoreInner {
    state: Mutex<BeverageState>,
    observers: Mutex<Vec<Observer<BeverageState>>>,
}

/// Shared state of the beverage app. Clones share the same state, and every
/// mutation is reported to the subscribed observers.
#[derive(Clone)]
pub struct BeverageStore {
    inner: Arc<StoreInner>,
}

impl Default for BeverageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BeverageStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(BeverageState::default()),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> BeverageState {
        lock(&self.inner.state).clone()
    }

    /// `observer` sees the full state after every mutation.
    pub fn subscribe(&self, observer: Observer<BeverageState>) {
        lock(&self.inner.observers).push(observer);
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut BeverageState) -> R) -> R {
        let (result, snapshot) = {
            let mut state = lock(&self.inner.state);
            let result = mutate(&mut state);
            (result, state.clone())
        };
        let observers = lock(&self.inner.observers).clone();
        for observer in observers {
            observer.notify(&snapshot);
        }
        result
    }

    pub fn set_user(&self, user: Option<User>) {
        self.update(|state| state.user = user);
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.update(|state| state.current_name = name);
    }

    /// Unknown temperatures are ignored.
    pub fn select_temperature(&self, temperature: &str) -> bool {
        self.update(|state| {
            let known = state.temperatures.iter().any(|temp| temp == temperature);
            if known {
                state.current_temp = temperature.to_string();
            }
            known
        })
    }

    pub fn select_base(&self, id: &str) -> bool {
        self.update(|state| select(&state.bases, id, &mut state.current_base))
    }

    pub fn select_creamer(&self, id: &str) -> bool {
        self.update(|state| select(&state.creamers, id, &mut state.current_creamer))
    }

    pub fn select_syrup(&self, id: &str) -> bool {
        self.update(|state| select(&state.syrups, id, &mut state.current_syrup))
    }

    /// Loads the base, creamer and syrup catalogs from the local cache and
    /// selects the first entry of each.
    pub async fn load_catalog(&self, client: &FirestoreClient) -> FirestoreResult<()> {
        let bases = read_catalog(client, BASES_COLLECTION).await?;
        let creamers = read_catalog(client, CREAMERS_COLLECTION).await?;
        let syrups = read_catalog(client, SYRUPS_COLLECTION).await?;
        self.update(|state| {
            state.current_base = bases.first().cloned();
            state.current_creamer = creamers.first().cloned();
            state.current_syrup = syrups.first().cloned();
            state.bases = bases;
            state.creamers = creamers;
            state.syrups = syrups;
        });
        Ok(())
    }

    /// Keeps the three catalogs in sync with the backend. A selection that
    /// disappears from its catalog falls back to the first entry.
    pub async fn watch_catalog(&self, client: &FirestoreClient) -> FirestoreResult<Vec<ListenerId>> {
        let mut listener_ids = Vec::with_capacity(3);
        for collection in [BASES_COLLECTION, CREAMERS_COLLECTION, SYRUPS_COLLECTION] {
            let store = self.clone();
            let observer = Observer::new(move |snapshot: &ViewSnapshot| {
                let entries: Vec<Ingredient> = snapshot
                    .documents
                    .iter()
                    .filter_map(|document| Ingredient::from_document(document).ok())
                    .collect();
                store.update(|state| {
                    let (options, current) = match collection {
                        BASES_COLLECTION => (&mut state.bases, &mut state.current_base),
                        CREAMERS_COLLECTION => (&mut state.creamers, &mut state.current_creamer),
                        _ => (&mut state.syrups, &mut state.current_syrup),
                    };
                    let still_listed = current
                        .as_ref()
                        .is_some_and(|selected| entries.iter().any(|entry| entry.id == selected.id));
                    if !still_listed {
                        *current = entries.first().cloned();
                    }
                    *options = entries;
                });
            })
            .with_error(move |error| {
                log::warn!("BeverageStore: {collection} listener failed: {error}");
            });
            let query = Query::collection(collection)?;
            listener_ids.push(client.listen(query, ListenOptions::default(), observer).await?);
        }
        Ok(listener_ids)
    }

    /// Listens to the signed-in user's beverages and mirrors them into the
    /// state. Returns `None` when nobody is signed in.
    pub async fn watch_beverages(&self, client: &FirestoreClient) -> FirestoreResult<Option<ListenerId>> {
        let Some(uid) = self.state().signed_in_uid() else {
            self.update(|state| state.beverages.clear());
            return Ok(None);
        };
        let query = Query::collection(BEVERAGES_COLLECTION)?.where_field(
            "uid",
            FilterOperator::Equal,
            FirestoreValue::from_string(uid),
        )?;

        let store = self.clone();
        let error_store = self.clone();
        let observer = Observer::new(move |snapshot: &ViewSnapshot| {
            let beverages = beverages_in(snapshot);
            store.update(|state| {
                if let Some(current) = &state.current_beverage {
                    state.current_beverage = beverages.iter().find(|b| b.id == current.id).cloned();
                }
                state.beverages = beverages;
            });
        })
        .with_error(move |error| {
            log::warn!("BeverageStore: beverage listener failed: {error}");
            let message = error.message().to_string();
            error_store.update(|state| state.message = message);
        });

        let listener_id = client.listen(query, ListenOptions::default(), observer).await?;
        Ok(Some(listener_id))
    }

    /// Makes a listed beverage current and copies its choices into the
    /// selection.
    pub fn show_beverage(&self, id: &str) -> bool {
        self.update(|state| {
            let Some(beverage) = state.beverages.iter().find(|b| b.id == id).cloned() else {
                return false;
            };
            state.current_temp = beverage.temperature.clone();
            state.current_base = beverage.base.clone();
            state.current_creamer = beverage.creamer.clone();
            state.current_syrup = beverage.syrup.clone();
            state.current_name = beverage.name.clone();
            state.current_beverage = Some(beverage);
            true
        })
    }

    /// Saves the current selection as a new beverage of the signed-in user.
    /// Without a user only the message changes.
    pub async fn make_beverage(&self, client: &FirestoreClient) -> FirestoreResult<()> {
        let state = self.state();
        let Some(uid) = state.signed_in_uid() else {
            self.update(|state| state.message = NO_USER_MESSAGE.to_string());
            return Ok(());
        };

        let beverage = Beverage {
            id: format!("{uid}-{}", Utc::now().timestamp_millis()),
            uid,
            name: state.current_name.clone(),
            temperature: state.current_temp.clone(),
            base: state.current_base.clone(),
            creamer: state.current_creamer.clone(),
            syrup: state.current_syrup.clone(),
        };
        let key = DocumentKey::from_string(&format!("{BEVERAGES_COLLECTION}/{}", beverage.id))?;
        if let Err(err) = client.write(vec![Mutation::set(key, beverage.to_map())]).await {
            log::warn!("BeverageStore: saving beverage {} failed: {err}", beverage.id);
            let message = err.message().to_string();
            self.update(|state| state.message = message);
            return Err(err);
        }

        log::debug!("BeverageStore: made beverage {}", beverage.id);
        self.update(|state| {
            state.message = format!("Beverage {} made successfully!", beverage.name);
            state.current_name.clear();
            state.upsert_beverage(beverage.clone());
            state.current_beverage = Some(beverage);
        });
        Ok(())
    }
}

fn select(options: &[Ingredient], id: &str, current: &mut Option<Ingredient>) -> bool {
    match options.iter().find(|option| option.id == id) {
        Some(option) => {
            *current = Some(option.clone());
            true
        }
        None => false,
    }
}

async fn read_catalog(client: &FirestoreClient, collection: &str) -> FirestoreResult<Vec<Ingredient>> {
    let snapshot = client
        .get_documents_from_local_cache(Query::collection(collection)?)
        .await?;
    snapshot
        .documents
        .iter()
        .map(Ingredient::from_document)
        .collect()
}

fn beverages_in(snapshot: &ViewSnapshot) -> Vec<Beverage> {
    snapshot
        .documents
        .iter()
        .filter_map(|document| match Beverage::from_document(document) {
            Ok(beverage) => Some(beverage),
            Err(err) => {
                log::warn!("BeverageStore: skipping malformed beverage {}: {err}", document.key());
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::client::FirestoreSettings;
    use crate::firestore::credentials::EmptyCredentialsProvider;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::InMemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn beverage(id: &str, name: &str) -> Beverage {
        Beverage {
            id: id.to_string(),
            uid: "u1".to_string(),
            name: name.to_string(),
            temperature: "Cold".to_string(),
            base: Some(Ingredient::new("tea", "Tea", Some("#C8A165"))),
            creamer: None,
            syrup: Some(Ingredient::new("vanilla", "Vanilla", None)),
        }
    }

    #[test]
    fn starts_with_hot_and_cold() {
        let state = BeverageStore::new().state();
        assert_eq!(state.temperatures, vec!["Hot", "Cold"]);
        assert_eq!(state.current_temp, "Hot");
        assert!(state.beverages.is_empty());
    }

    #[test]
    fn observers_see_every_mutation() {
        let store = BeverageStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        store.subscribe(Observer::new(move |_: &BeverageState| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        store.set_name("Iced Tea");
        assert!(store.select_temperature("Cold"));
        assert!(!store.select_temperature("Lukewarm"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.state().current_temp, "Cold");
    }

    #[test]
    fn show_beverage_copies_its_choices() {
        let store = BeverageStore::new();
        store.update(|state| state.beverages.push(beverage("u1-1", "Iced Tea")));

        assert!(store.show_beverage("u1-1"));
        assert!(!store.show_beverage("u1-2"));
        let state = store.state();
        assert_eq!(state.current_beverage.as_ref().map(|b| b.id.as_str()), Some("u1-1"));
        assert_eq!(state.current_temp, "Cold");
        assert_eq!(state.current_syrup.map(|s| s.name), Some("Vanilla".to_string()));
        assert!(state.current_creamer.is_none());
    }

    #[tokio::test]
    async fn making_a_beverage_requires_a_user() {
        let (client_end, _server_end) = InMemoryTransport::pair();
        let client = FirestoreClient::connect(
            DatabaseId::default("coffee-shop"),
            client_end,
            Arc::new(EmptyCredentialsProvider),
            FirestoreSettings::default(),
        )
        .await
        .unwrap();
        let store = BeverageStore::new();
        store.set_name("Morning Brew");

        store.make_beverage(&client).await.unwrap();

        let state = store.state();
        assert_eq!(state.message, NO_USER_MESSAGE);
        assert!(state.beverages.is_empty());
        assert_eq!(state.current_name, "Morning Brew");
        assert_eq!(store.watch_beverages(&client).await.unwrap(), None);
    }
}

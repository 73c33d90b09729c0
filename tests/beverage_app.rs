mod common;

use common::{client_for, eventually, fields, FakeBackend};
use firestore_offline_sync::beverage::{BeverageStore, NO_USER_MESSAGE};
use firestore_offline_sync::firestore::credentials::User;

fn seed_catalog(backend: &FakeBackend) {
    backend.seed("bases/coffee", fields(&[("name", "Coffee"), ("color", "#6F4E37")]));
    backend.seed("creamers/whole-milk", fields(&[("name", "Whole Milk"), ("color", "#FFFFFF")]));
    backend.seed("syrups/none", fields(&[("name", "No Syrup")]));
}

#[tokio::test]
async fn making_a_beverage_saves_the_selection() {
    let backend = FakeBackend::new();
    seed_catalog(&backend);
    let user = User::new("u1");
    let client = client_for(&backend, Some(user.clone())).await;

    let store = BeverageStore::new();
    store.set_user(Some(user));
    store.watch_catalog(&client).await.unwrap();
    eventually("the catalog", || {
        let state = store.state();
        !state.bases.is_empty() && !state.creamers.is_empty() && !state.syrups.is_empty()
    })
    .await;

    store.load_catalog(&client).await.unwrap();
    let state = store.state();
    assert_eq!(state.current_base.as_ref().unwrap().name, "Coffee");
    assert_eq!(state.current_base.as_ref().unwrap().color.as_deref(), Some("#6F4E37"));
    assert_eq!(state.current_creamer.as_ref().unwrap().name, "Whole Milk");
    assert_eq!(state.current_syrup.as_ref().unwrap().name, "No Syrup");

    store.set_name("Morning Brew");
    assert!(store.select_temperature("Hot"));
    store.watch_beverages(&client).await.unwrap().unwrap();
    store.make_beverage(&client).await.unwrap();

    let state = store.state();
    assert_eq!(state.message, "Beverage Morning Brew made successfully!");
    assert!(state.current_name.is_empty());
    let beverage = state.current_beverage.clone().unwrap();
    assert!(beverage.id.starts_with("u1-"));
    assert_eq!(beverage.uid, "u1");
    assert_eq!(beverage.temperature, "Hot");
    assert_eq!(beverage.base.as_ref().unwrap().name, "Coffee");
    assert_eq!(beverage.creamer.as_ref().unwrap().name, "Whole Milk");
    assert_eq!(beverage.syrup.as_ref().unwrap().name, "No Syrup");
    assert!(state.beverages.iter().any(|listed| listed.id == beverage.id));

    let stored = backend.documents_in("beverages");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].key().id(), beverage.id);

    eventually("the listener to keep the beverage", || {
        store.state().beverages.iter().any(|listed| listed.id == beverage.id)
    })
    .await;
}

#[tokio::test]
async fn signed_out_users_cannot_make_beverages() {
    let backend = FakeBackend::new();
    seed_catalog(&backend);
    let client = client_for(&backend, None).await;

    let store = BeverageStore::new();
    assert!(store.watch_beverages(&client).await.unwrap().is_none());
    store.set_name("Morning Brew");
    store.make_beverage(&client).await.unwrap();

    let state = store.state();
    assert_eq!(state.message, NO_USER_MESSAGE);
    assert_eq!(state.current_name, "Morning Brew");
    assert!(state.beverages.is_empty());
    assert_eq!(backend.commit_count(), 0);
}

#[tokio::test]
async fn listed_beverages_can_be_shown_again() {
    let backend = FakeBackend::new();
    seed_catalog(&backend);
    backend.seed(
        "beverages/u1-1",
        fields(&[("uid", "u1"), ("name", "Iced Latte"), ("temperature", "Cold")]),
    );
    backend.seed(
        "beverages/u2-1",
        fields(&[("uid", "u2"), ("name", "Someone else's"), ("temperature", "Hot")]),
    );
    let user = User::new("u1");
    let client = client_for(&backend, Some(user.clone())).await;

    let store = BeverageStore::new();
    store.set_user(Some(user));
    store.watch_beverages(&client).await.unwrap();
    eventually("u1's beverages", || !store.state().beverages.is_empty()).await;

    let state = store.state();
    assert_eq!(state.beverages.len(), 1);
    assert!(store.show_beverage("u1-1"));
    let state = store.state();
    assert_eq!(state.current_name, "Iced Latte");
    assert_eq!(state.current_temp, "Cold");
    assert!(!store.show_beverage("u2-1"));
}

//! Beverage maker demo: signed-in users combine a temperature, base,
//! creamer and syrup into named drinks that sync through the client.

mod model;
mod store;

pub use model::{
    Beverage, Ingredient, BASES_COLLECTION, BEVERAGES_COLLECTION, CREAMERS_COLLECTION, SYRUPS_COLLECTION,
};
pub use store::{BeverageState, BeverageStore, NO_USER_MESSAGE, TEMPERATURES};

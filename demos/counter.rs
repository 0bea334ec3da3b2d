//! Self-contained example: a value entity counter, an event sourced
//! wallet, and an action that forwards to the counter, all served by the
//! in-memory `Host`.
//!
//! Run with: `cargo run --example counter`
//!
//! Set `RUST_LOG=entity_router=debug` to see actor spawns and forwards.

use entity_router::{
    CommandContext, Component, ComponentKind, DeferredCall, Effect, Empty, EntityContext, Host,
    NoEvents, Provider, Registration, Registry, RouterBuilder,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

// ---------------------------------------------------------------------------
// Counter value entity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CounterState {
    value: i64,
}

#[derive(Deserialize)]
struct ChangeValue {
    value: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CurrentCounter {
    value: i64,
}

struct Counter;

impl Counter {
    fn increase(&self, state: &CounterState, cmd: ChangeValue) -> Effect<Empty, CounterState> {
        if cmd.value < 0 {
            return Effect::error("increase value must be a positive number");
        }
        Effect::update_state(CounterState {
            value: state.value + cmd.value,
        })
        .then_reply(Empty {})
    }

    fn decrease(&self, state: &CounterState, cmd: ChangeValue) -> Effect<Empty, CounterState> {
        Effect::update_state(CounterState {
            value: state.value - cmd.value,
        })
        .then_reply(Empty {})
    }

    fn current(&self, state: &CounterState, _: Empty) -> Effect<CurrentCounter, CounterState> {
        Effect::reply(CurrentCounter { value: state.value })
    }
}

impl Component for Counter {
    const COMPONENT_ID: &'static str = "counter";
    const KIND: ComponentKind = ComponentKind::ValueEntity;
    type State = CounterState;
    type Event = NoEvents;

    fn empty_state(&self) -> CounterState {
        CounterState::default()
    }

    fn routes(routes: RouterBuilder<Self>) -> RouterBuilder<Self> {
        routes
            .command("Increase", Counter::increase)
            .command("Decrease", Counter::decrease)
            .command("GetCurrentCounter", Counter::current)
    }
}

// ---------------------------------------------------------------------------
// Wallet event sourced entity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Wallet {
    balance: i64,
}

/// Events emitted by the wallet entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum WalletEvent {
    Funded { amount: i64 },
    Charged { amount: i64 },
}

#[derive(Deserialize)]
struct Amount {
    amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Balance {
    balance: i64,
}

struct WalletEntity;

impl WalletEntity {
    fn fund(&self, _: &Wallet, cmd: Amount) -> Effect<Balance, Wallet, WalletEvent> {
        Effect::emit_event(WalletEvent::Funded { amount: cmd.amount })
            .then_reply_with(|w: &Wallet| Balance { balance: w.balance })
    }

    fn charge(&self, wallet: &Wallet, cmd: Amount) -> Effect<Balance, Wallet, WalletEvent> {
        if cmd.amount > wallet.balance {
            return Effect::error("insufficient funds");
        }
        Effect::emit_event(WalletEvent::Charged { amount: cmd.amount })
            .then_reply_with(|w: &Wallet| Balance { balance: w.balance })
    }

    fn apply(&self, mut wallet: Wallet, event: &WalletEvent) -> Wallet {
        match event {
            WalletEvent::Funded { amount } => wallet.balance += amount,
            WalletEvent::Charged { amount } => wallet.balance -= amount,
        }
        wallet
    }
}

impl Component for WalletEntity {
    const COMPONENT_ID: &'static str = "wallet";
    const KIND: ComponentKind = ComponentKind::EventSourcedEntity;
    type State = Wallet;
    type Event = WalletEvent;

    fn empty_state(&self) -> Wallet {
        Wallet::default()
    }

    fn routes(routes: RouterBuilder<Self>) -> RouterBuilder<Self> {
        routes
            .command("Fund", WalletEntity::fund)
            .command("Charge", WalletEntity::charge)
            .event(WalletEntity::apply)
    }
}

// ---------------------------------------------------------------------------
// Doubler action
// ---------------------------------------------------------------------------

/// Forwards `Increase` to a counter with twice the requested value.
struct Doubler;

#[derive(Deserialize)]
struct DoubleIncrease {
    counter_id: String,
    value: i64,
}

impl Doubler {
    fn double(&self, _: &(), cmd: DoubleIncrease, ctx: &CommandContext) -> Effect<Empty> {
        let call = ctx
            .call("counter", "Increase", json!({ "value": cmd.value * 2 }))
            .with_entity_id(cmd.counter_id);
        Effect::forward(call)
    }
}

impl Component for Doubler {
    const COMPONENT_ID: &'static str = "doubler";
    const KIND: ComponentKind = ComponentKind::Action;
    type State = ();
    type Event = NoEvents;

    fn empty_state(&self) {}

    fn routes(routes: RouterBuilder<Self>) -> RouterBuilder<Self> {
        routes.command_with_context("Double", Doubler::double)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let registry = Registry::new().with_components([
        Registration::from(Provider::of(|_: &EntityContext| Counter)),
        Registration::from(Provider::of(|_: &EntityContext| WalletEntity)),
        Registration::from(Provider::of(|_: &EntityContext| Doubler)),
    ])?;
    let host = Host::new(registry);

    let counter = |command: &str, payload| {
        DeferredCall::new("counter", command, payload).with_entity_id("alpha")
    };

    host.call(counter("Increase", json!({ "value": 10 }))).await?;
    host.call(counter("Decrease", json!({ "value": 3 }))).await?;
    host.call(DeferredCall::new(
        "doubler",
        "Double",
        json!({ "counter_id": "alpha", "value": 4 }),
    ))
    .await?;

    match host.call(counter("Increase", json!({ "value": -5 }))).await {
        Err(e) => println!("rejected: {e}"),
        Ok(_) => return Err("negative increase should be rejected".into()),
    }

    let current: Option<CurrentCounter> = host
        .call(counter("GetCurrentCounter", json!({})))
        .await?
        .decode()?;
    let alpha = current.map(|c| c.value).unwrap_or_default();
    println!("alpha = {alpha}");

    let wallet = |command: &str, amount: i64| {
        DeferredCall::new("wallet", command, json!({ "amount": amount })).with_entity_id("w-1")
    };
    host.call(wallet("Fund", 100)).await?;
    let balance: Option<Balance> = host.call(wallet("Charge", 30)).await?.decode()?;
    let balance = balance.map(|b| b.balance).unwrap_or_default();
    println!("wallet balance = {balance}");

    assert_eq!(alpha, 15, "alpha should be 10 - 3 + 2 * 4");
    assert_eq!(balance, 70);

    println!("all assertions passed");

    Ok(())
}

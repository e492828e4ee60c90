//! End-to-end gateway tests: real HTTP surface, real store, mock wallet,
//! and a stub merchant endpoint for notify delivery.

use std::{
    collections::{HashMap, VecDeque},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{Router, extract::Form, extract::State, routing::post};
use paygate::{
    callback::{CallbackEngine, NotifyDispatcher},
    credentials::CredentialResolver,
    locks::CredentialLocks,
    order::OrderEngine,
    poll::PollerRegistry,
    reconcile::{FailureCounters, Reconciler},
    server::{RouterState, router, spawn_server_task},
    testing::{MockBalanceSource, seed_merchant_with_credential},
    wallet::BalanceQuery,
};
use paygate_core::{
    sign,
    status::{CallbackStatus, OrderStatus},
};
use paygate_store::{Credential, Merchant, NewOrder, Store};
use paygate_tokio::shutdown::ShutdownChannel;

const ANY_LOCAL: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));

struct TestGateway {
    url: String,
    store: Store,
    wallet: Arc<MockBalanceSource>,
    merchant: Merchant,
    credential: Credential,
    shutdown: ShutdownChannel,
}

/// Wire the full component graph with a mock wallet and bind a real
/// listener on an ephemeral port.
fn spawn_gateway() -> TestGateway {
    let store = Store::open_in_memory().expect("store");
    let (merchant, credential) = seed_merchant_with_credential(&store);
    let wallet = Arc::new(MockBalanceSource::new());

    let locks = CredentialLocks::new();
    let resolver = CredentialResolver::new(store.clone());
    let callbacks = Arc::new(CallbackEngine::new(store.clone()));
    let dispatcher = Arc::new(NotifyDispatcher::new(callbacks.clone()));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        resolver.clone(),
        wallet.clone() as Arc<dyn BalanceQuery>,
        locks.clone(),
        dispatcher,
        FailureCounters::new(),
    ));
    let shutdown = ShutdownChannel::new();
    let pollers =
        PollerRegistry::new(store.clone(), reconciler.clone(), shutdown.clone());
    let orders = OrderEngine::new(
        store.clone(),
        resolver.clone(),
        wallet.clone() as Arc<dyn BalanceQuery>,
        locks,
    );

    let state = Arc::new(RouterState {
        store: store.clone(),
        orders,
        reconciler,
        pollers,
        callbacks,
        resolver,
    });
    let (task, url) =
        spawn_server_task(ANY_LOCAL, router(state), shutdown.clone())
            .expect("server spawn");
    task.detach();

    TestGateway {
        url,
        store,
        wallet,
        merchant,
        credential,
        shutdown,
    }
}

/// A stub merchant notify endpoint: records every delivery and replies from
/// a script (falling back to "success" once the script runs dry).
#[derive(Clone)]
struct NotifyStub {
    hits: Arc<Mutex<Vec<HashMap<String, String>>>>,
    script: Arc<Mutex<VecDeque<String>>>,
}

impl NotifyStub {
    fn spawn(script: &[&str]) -> (Self, String) {
        let stub = Self {
            hits: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(
                script.iter().map(|s| s.to_string()).collect(),
            )),
        };

        async fn notify(
            State(stub): State<NotifyStub>,
            Form(params): Form<HashMap<String, String>>,
        ) -> String {
            stub.hits.lock().unwrap().push(params);
            stub.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "success".to_owned())
        }

        let app = Router::new()
            .route("/notify", post(notify))
            .with_state(stub.clone());
        let listener = std::net::TcpListener::bind(ANY_LOCAL).expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        let url = format!(
            "http://{}/notify",
            listener.local_addr().expect("local addr"),
        );
        let listener =
            tokio::net::TcpListener::from_std(listener).expect("to tokio");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (stub, url)
    }

    fn hit_count(&self) -> usize {
        self.hits.lock().unwrap().len()
    }

    fn hits(&self) -> Vec<HashMap<String, String>> {
        self.hits.lock().unwrap().clone()
    }
}

fn signed_create_form(
    merchant: &Merchant,
    mut params: HashMap<String, String>,
) -> HashMap<String, String> {
    params.insert("pid".to_owned(), merchant.id.to_string());
    params.insert("sign_type".to_owned(), "MD5".to_owned());
    let signature = sign::md5_sign(
        params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &merchant.key,
    );
    params.insert("sign".to_owned(), signature);
    params
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn create_pay_query_notify_flow() {
    let gw = spawn_gateway();
    let (stub, notify_url) = NotifyStub::spawn(&[]);
    gw.wallet
        .set_balance(gw.credential.id, "1000.00".parse().unwrap());

    let http = reqwest::Client::new();

    // Create a signed order.
    let form = signed_create_form(
        &gw.merchant,
        HashMap::from([
            ("type".to_owned(), "alipay".to_owned()),
            ("out_trade_no".to_owned(), "shop-001".to_owned()),
            ("name".to_owned(), "widget".to_owned()),
            ("money".to_owned(), "10.00".to_owned()),
            ("notify_url".to_owned(), notify_url.clone()),
            (
                "return_url".to_owned(),
                "https://shop.example/done?session=abc".to_owned(),
            ),
        ]),
    );
    let created: serde_json::Value = http
        .post(format!("{}/pay/create", gw.url))
        .form(&form)
        .send()
        .await
        .expect("create request")
        .json()
        .await
        .expect("create json");
    assert_eq!(created["code"], 1, "create failed: {created}");
    assert_eq!(created["money"], "10.00");
    assert_eq!(created["qrcode"], gw.credential.qrcode_url);
    let trade_no = created["trade_no"].as_str().expect("trade_no").to_owned();

    // The status endpoint reads stored state only.
    let status: serde_json::Value = http
        .get(format!("{}/pay/status/{trade_no}", gw.url))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status json");
    assert_eq!(status["status"], 0);
    assert_eq!(status["status_text"], "pending");

    // Buyer pays: the wallet balance moves by exactly the order amount.
    gw.wallet
        .set_balance(gw.credential.id, "1010.00".parse().unwrap());

    // The merchant's order query triggers an inline reconciliation.
    let order_resp: serde_json::Value = http
        .get(format!(
            "{}/pay/query?act=order&pid={}&key={}&trade_no={}",
            gw.url, gw.merchant.id, gw.merchant.key, trade_no,
        ))
        .send()
        .await
        .expect("query request")
        .json()
        .await
        .expect("query json");
    assert_eq!(order_resp["code"], 1, "order query failed: {order_resp}");
    assert_eq!(order_resp["status"], 1);
    assert_eq!(order_resp["money"], "10.00");
    assert_ne!(order_resp["endtime"], "");

    // The notify fires asynchronously and the merchant acks it.
    wait_until(|| stub.hit_count() >= 1, "notify delivery").await;
    let delivery = &stub.hits()[0];
    assert_eq!(delivery["trade_status"], "TRADE_SUCCESS");
    assert_eq!(delivery["out_trade_no"], "shop-001");
    assert_eq!(delivery["money"], "10.00");
    let delivery_sign = delivery["sign"].clone();
    assert!(sign::md5_verify(
        delivery.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &gw.merchant.key,
        &delivery_sign,
    ));

    let order = gw.store.order_by_trade_no(&trade_no).unwrap().unwrap();
    wait_until(
        || {
            gw.store
                .order_by_id(order.id)
                .unwrap()
                .unwrap()
                .callback_status
                == CallbackStatus::Ok
        },
        "callback state OK",
    )
    .await;
    assert_eq!(
        gw.store.callback_logs_for_order(order.id).unwrap().len(),
        1,
    );

    // Merchant snapshot: credited balance and derived counters.
    let merchant_resp: serde_json::Value = http
        .get(format!(
            "{}/pay/query?act=query&pid={}&key={}",
            gw.url, gw.merchant.id, gw.merchant.key,
        ))
        .send()
        .await
        .expect("merchant query request")
        .json()
        .await
        .expect("merchant query json");
    assert_eq!(merchant_resp["code"], 1);
    assert_eq!(merchant_resp["money"], "10.00");
    assert_eq!(merchant_resp["orders"], 1);
    assert_eq!(merchant_resp["order_today"], 1);

    // The buyer-facing pay page carries the QR and the merged return URL.
    let page: serde_json::Value = http
        .get(format!("{}/pay/page/{trade_no}", gw.url))
        .send()
        .await
        .expect("page request")
        .json()
        .await
        .expect("page json");
    assert_eq!(page["code"], 1);
    assert_eq!(page["qrcode_url"], gw.credential.qrcode_url);
    let return_url = page["return_url"].as_str().unwrap();
    assert!(return_url.contains("session=abc"));
    assert!(return_url.contains("trade_status=TRADE_SUCCESS"));

    gw.shutdown.send();
}

#[tokio::test(flavor = "multi_thread")]
async fn create_rejects_bad_requests() {
    let gw = spawn_gateway();
    gw.wallet
        .set_balance(gw.credential.id, "1000.00".parse().unwrap());
    let http = reqwest::Client::new();

    // Missing required fields.
    let resp: serde_json::Value = http
        .post(format!("{}/pay/create", gw.url))
        .form(&HashMap::from([(
            "pid".to_owned(),
            gw.merchant.id.to_string(),
        )]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["code"], -1);

    // Tampered signature.
    let mut form = signed_create_form(
        &gw.merchant,
        HashMap::from([
            ("type".to_owned(), "alipay".to_owned()),
            ("out_trade_no".to_owned(), "shop-002".to_owned()),
            ("name".to_owned(), "widget".to_owned()),
            ("money".to_owned(), "10.00".to_owned()),
        ]),
    );
    form.insert("money".to_owned(), "1.00".to_owned());
    let resp: serde_json::Value = http
        .post(format!("{}/pay/create", gw.url))
        .form(&form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["code"], -1);
    assert_eq!(resp["msg"], "invalid signature");

    // Unknown merchant.
    let mut form = HashMap::from([
        ("type".to_owned(), "alipay".to_owned()),
        ("out_trade_no".to_owned(), "shop-003".to_owned()),
        ("name".to_owned(), "widget".to_owned()),
        ("money".to_owned(), "10.00".to_owned()),
        ("sign_type".to_owned(), "MD5".to_owned()),
        ("pid".to_owned(), "424242".to_owned()),
    ]);
    let signature = sign::md5_sign(
        form.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &gw.merchant.key,
    );
    form.insert("sign".to_owned(), signature);
    let resp: serde_json::Value = http
        .post(format!("{}/pay/create", gw.url))
        .form(&form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["code"], -1);
    assert_eq!(resp["msg"], "unknown merchant");

    // Wrong key on the query surface.
    let resp: serde_json::Value = http
        .get(format!(
            "{}/pay/query?act=query&pid={}&key=wrong",
            gw.url, gw.merchant.id,
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["code"], -1);
    assert_eq!(resp["msg"], "invalid merchant key");

    gw.shutdown.send();
}

/// A merchant that replies `fail` three times and then `success`: the
/// engine must stop after the fourth delivery with exactly four log rows.
#[tokio::test(flavor = "multi_thread")]
async fn notify_retries_until_merchant_acks() {
    let store = Store::open_in_memory().unwrap();
    let (merchant, credential) = seed_merchant_with_credential(&store);
    let (stub, notify_url) = NotifyStub::spawn(&["fail", "fail", "fail"]);

    let order = store
        .insert_order(&NewOrder {
            trade_no: "20250101120000123456654321".into(),
            out_trade_no: "shop-1".to_owned(),
            merchant_id: merchant.id,
            credential_id: credential.id,
            pay_type: "alipay".to_owned(),
            name: "widget".to_owned(),
            original_money: "10.00".parse().unwrap(),
            money: "10.00".parse().unwrap(),
            adjust_amount: "0.00".parse().unwrap(),
            notify_url: Some(notify_url),
            return_url: None,
            param: None,
            clientip: None,
            device: "pc".to_owned(),
            channel_id: None,
            base_balance: "1000.00".parse().unwrap(),
        })
        .unwrap();
    store
        .confirm_paid(
            &[order.id],
            "1010.00".parse().unwrap(),
            chrono::Utc::now(),
        )
        .unwrap();
    let engine = CallbackEngine::new(store.clone());

    let expect_state = |status: CallbackStatus, attempts: i64| {
        let order = store.order_by_id(order.id).unwrap().unwrap();
        assert_eq!(order.callback_status, status);
        assert_eq!(order.callback_attempts, attempts);
    };

    // Three failures keep the order in the retry machine.
    for attempt in 1..=3 {
        assert!(!engine.send_notify(order.id).await.unwrap());
        expect_state(CallbackStatus::InFlight, attempt);
    }
    // Fourth delivery: the merchant finally acks.
    assert!(engine.send_notify(order.id).await.unwrap());
    expect_state(CallbackStatus::Ok, 4);

    assert_eq!(stub.hit_count(), 4);
    assert_eq!(store.callback_logs_for_order(order.id).unwrap().len(), 4);

    // Acked orders leave the retry scanner's view entirely: no fifth
    // delivery no matter how much time passes.
    let far_future = chrono::Utc::now() + chrono::Duration::hours(6);
    engine.scan_once(far_future).await.unwrap();
    assert_eq!(stub.hit_count(), 4);
    expect_state(CallbackStatus::Ok, 4);
}

/// The operator re-notify endpoint: 404 for unknown orders, refused for
/// expired ones, otherwise exactly one immediate delivery per call.
#[tokio::test(flavor = "multi_thread")]
async fn admin_renotify_gates_and_delivers() {
    let gw = spawn_gateway();
    gw.wallet
        .set_balance(gw.credential.id, "1000.00".parse().unwrap());
    let http = reqwest::Client::new();

    // Unknown order: HTTP 404 with the error envelope.
    let resp = http
        .post(format!("{}/admin/orders/nope/renotify", gw.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], -1);
    assert_eq!(body["msg"], "unknown order");

    // A pending order whose merchant fails the first delivery.
    let (stub, notify_url) = NotifyStub::spawn(&["fail"]);
    let form = signed_create_form(
        &gw.merchant,
        HashMap::from([
            ("type".to_owned(), "alipay".to_owned()),
            ("out_trade_no".to_owned(), "manual-1".to_owned()),
            ("name".to_owned(), "widget".to_owned()),
            ("money".to_owned(), "10.00".to_owned()),
            ("notify_url".to_owned(), notify_url),
        ]),
    );
    let created: serde_json::Value = http
        .post(format!("{}/pay/create", gw.url))
        .form(&form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["code"], 1, "create failed: {created}");
    let trade_no = created["trade_no"].as_str().unwrap().to_owned();
    let renotify_url =
        format!("{}/admin/orders/{trade_no}/renotify", gw.url);

    // First manual attempt: the merchant replies "fail".
    let body: serde_json::Value = http
        .post(&renotify_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["code"], -1);
    assert_eq!(body["msg"], "notify failed; see the callback logs");
    assert_eq!(stub.hit_count(), 1);

    // Second manual attempt: the merchant acks.
    let body: serde_json::Value = http
        .post(&renotify_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["code"], 1);
    assert_eq!(body["msg"], "notify delivered");
    assert_eq!(stub.hit_count(), 2);

    let order = gw.store.order_by_trade_no(&trade_no).unwrap().unwrap();
    assert_eq!(order.callback_status, CallbackStatus::Ok);
    assert_eq!(order.callback_attempts, 2);
    assert_eq!(
        gw.store.callback_logs_for_order(order.id).unwrap().len(),
        2,
    );

    // Expired orders are refused, with no further deliveries.
    assert!(gw.store.expire_order(&trade_no, chrono::Utc::now()).unwrap());
    let body: serde_json::Value = http
        .post(&renotify_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["code"], -1);
    assert_eq!(body["msg"], "only pending or paid orders can be notified");
    assert_eq!(stub.hit_count(), 2);

    gw.shutdown.send();
}

/// Order expiry frees the amount and the rebase pass refreshes baselines,
/// after which a new payment still reconciles correctly.
#[tokio::test(flavor = "multi_thread")]
async fn expiry_rebases_surviving_orders() {
    let gw = spawn_gateway();
    gw.wallet
        .set_balance(gw.credential.id, "1000.00".parse().unwrap());
    let http = reqwest::Client::new();

    let create = |out: &str, money: &str| {
        let form = signed_create_form(
            &gw.merchant,
            HashMap::from([
                ("type".to_owned(), "alipay".to_owned()),
                ("out_trade_no".to_owned(), out.to_owned()),
                ("name".to_owned(), "widget".to_owned()),
                ("money".to_owned(), money.to_owned()),
            ]),
        );
        let http = http.clone();
        let url = format!("{}/pay/create", gw.url);
        async move {
            let resp: serde_json::Value = http
                .post(url)
                .form(&form)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(resp["code"], 1, "create failed: {resp}");
            resp["trade_no"].as_str().unwrap().to_owned()
        }
    };

    let t1 = create("a", "5.00").await;
    let t2 = create("b", "7.00").await;

    // The first order dies (admin cancel path), then some unattributed
    // money arrives, e.g. that buyer paying after their order expired.
    assert!(gw.store.expire_order(&t1, chrono::Utc::now()).unwrap());
    gw.wallet
        .set_balance(gw.credential.id, "1005.00".parse().unwrap());

    // The reconciler rebases survivors to the current balance.
    let order2 = gw.store.order_by_trade_no(&t2).unwrap().unwrap();
    let resolver = CredentialResolver::new(gw.store.clone());
    let reconciler = Reconciler::new(
        gw.store.clone(),
        resolver,
        gw.wallet.clone() as Arc<dyn BalanceQuery>,
        CredentialLocks::new(),
        Arc::new(paygate::testing::RecordingDispatcher::new()),
        FailureCounters::new(),
    );
    reconciler.rebase_after_expiry().await.unwrap();
    let rebased = gw.store.order_by_id(order2.id).unwrap().unwrap();
    assert_eq!(rebased.base_balance.to_string(), "1005.00");

    // Now the second buyer pays; delta is 7.00 against the new baseline.
    gw.wallet
        .set_balance(gw.credential.id, "1012.00".parse().unwrap());
    assert!(reconciler.check_payment(&t2).await.unwrap());
    assert_eq!(
        gw.store.order_status(&t2).unwrap().unwrap(),
        OrderStatus::Paid,
    );

    gw.shutdown.send();
}

/// Concurrent creates at the same amount on one credential produce the
/// laddered unique money values regardless of interleaving.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_creates_never_collide_on_money() {
    let gw = spawn_gateway();
    gw.wallet
        .set_balance(gw.credential.id, "1000.00".parse().unwrap());
    let http = reqwest::Client::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let form = signed_create_form(
            &gw.merchant,
            HashMap::from([
                ("type".to_owned(), "alipay".to_owned()),
                ("out_trade_no".to_owned(), format!("conc-{i}")),
                ("name".to_owned(), "widget".to_owned()),
                ("money".to_owned(), "42.00".to_owned()),
            ]),
        );
        let http = http.clone();
        let url = format!("{}/pay/create", gw.url);
        handles.push(tokio::spawn(async move {
            let resp: serde_json::Value = http
                .post(url)
                .form(&form)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(resp["code"], 1, "create failed: {resp}");
            resp["money"].as_str().unwrap().to_owned()
        }));
    }

    let mut moneys = Vec::new();
    for handle in handles {
        moneys.push(handle.await.unwrap());
    }
    moneys.sort();
    let expected = (0..8)
        .map(|i| format!("42.{:02}", i))
        .collect::<Vec<_>>();
    assert_eq!(moneys, expected);

    gw.shutdown.send();
}

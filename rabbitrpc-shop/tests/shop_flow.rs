use rabbitrpc::{MemoryTransport, RpcClient, RpcConfig, ServerHandle, Service, Settings, TransportPtr};
use rabbitrpc_shop::contracts::{
    NewOrder, NewProduct, NewUser, Product, ProductPatch, StockCheckRequest, StockCheckResponse,
    ORDER_EXCHANGE, STOCK_CHECK,
};
use rabbitrpc_shop::orders::{ORDER_CANCELLED_MESSAGE, ORDER_CREATED_MESSAGE, STOCK_NOT_AVAILABLE};
use rabbitrpc_shop::{
    orders, products, users, MemoryCache, MemoryRepository, OrderService, ProductEvents,
    ProductService, UserService,
};
use std::sync::Arc;
use std::time::Duration;

struct Shop {
    transport: MemoryTransport,
    products: Arc<ProductService>,
    users: Arc<UserService>,
    orders: Arc<OrderService>,
    _servers: Vec<ServerHandle>,
}

async fn shop() -> Shop {
    let transport = MemoryTransport::new();
    let shared: TransportPtr = Arc::new(transport.clone());

    let mut product_service = Service::new(
        Settings::new(products::SERVICE_NAME),
        shared.clone(),
        ProductService::registry().unwrap(),
    )
    .await
    .unwrap();
    let products = Arc::new(ProductService::new(MemoryRepository::shared()));
    products.bind(&mut product_service).unwrap();

    let mut user_service = Service::new(
        Settings::new(users::SERVICE_NAME),
        shared.clone(),
        UserService::registry().unwrap(),
    )
    .await
    .unwrap();
    let users = Arc::new(UserService::new(MemoryRepository::shared(), MemoryCache::shared()));
    users.bind(&mut user_service).unwrap();

    let mut order_service = Service::new(
        Settings::new(orders::SERVICE_NAME),
        shared,
        OrderService::registry().unwrap(),
    )
    .await
    .unwrap();
    let orders = Arc::new(OrderService::from_service(MemoryRepository::shared(), &order_service));
    orders.bind(&mut order_service).unwrap();

    let servers = vec![
        product_service.start().await.unwrap(),
        user_service.start().await.unwrap(),
        order_service.start().await.unwrap(),
    ];

    Shop {
        transport,
        products,
        users,
        orders,
        _servers: servers,
    }
}

async fn seed(shop: &Shop, stock: u32) -> (Product, String) {
    let product = shop
        .products
        .create_product(NewProduct {
            name: "Kettle".to_string(),
            description: "Stainless steel kettle".to_string(),
            price: 24.0,
            stock,
        })
        .await
        .unwrap();
    let user = shop
        .users
        .create(NewUser {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
        })
        .await
        .unwrap();
    (product, user.id)
}

async fn client(shop: &Shop) -> RpcClient {
    RpcClient::start(Arc::new(shop.transport.clone()), &RpcConfig::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn create_order_decrements_stock_and_notifies_products() {
    let shop = shop().await;
    let (product, user_id) = seed(&shop, 10).await;

    let receipt = shop
        .orders
        .create_order(
            NewOrder {
                product_id: product.id.clone(),
                quantity: 2,
            },
            &user_id,
        )
        .await
        .unwrap();
    assert_eq!(receipt.message, ORDER_CREATED_MESSAGE);
    let order = receipt.order.unwrap();
    assert_eq!(order.quantity, 2);

    let updated = shop.products.get_product_by_id(&product.id).await.unwrap();
    assert_eq!(updated.stock, 8);

    tokio::time::timeout(Duration::from_secs(1), async {
        while shop.products.units_sold(&product.id) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(shop.products.units_sold(&product.id), 2);
}

#[tokio::test]
async fn insufficient_stock_is_reported_not_raised() {
    let shop = shop().await;
    let (product, user_id) = seed(&shop, 10).await;

    let receipt = shop
        .orders
        .create_order(
            NewOrder {
                product_id: product.id.clone(),
                quantity: 999,
            },
            &user_id,
        )
        .await
        .unwrap();
    assert_eq!(receipt.message, STOCK_NOT_AVAILABLE);
    assert!(receipt.order.is_none());
    assert_eq!(shop.products.get_product_by_id(&product.id).await.unwrap().stock, 10);

    let reply: StockCheckResponse = client(&shop)
        .await
        .request(
            STOCK_CHECK,
            ORDER_EXCHANGE,
            &StockCheckRequest {
                product_id: product.id,
                quantity: 999,
            },
        )
        .await
        .unwrap();
    assert_eq!(reply, StockCheckResponse { available: false });
}

#[tokio::test]
async fn order_views_join_product_and_user() {
    let shop = shop().await;
    let (product, user_id) = seed(&shop, 5).await;

    let order = shop
        .orders
        .create_order(
            NewOrder {
                product_id: product.id.clone(),
                quantity: 1,
            },
            &user_id,
        )
        .await
        .unwrap()
        .order
        .unwrap();

    let details = shop.orders.get_order_by_id(&order.id).await.unwrap();
    assert_eq!(details.id, order.id);
    assert_eq!(details.product.id, product.id);
    assert_eq!(details.product.name, "Kettle");
    assert_eq!(details.user.name, "alice");

    let lines = shop.orders.get_all_orders_by_user(&user_id).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].quantity, 1);
    assert_eq!(lines[0].product.price, 24.0);
    assert!(shop.orders.get_all_orders_by_user("nobody").await.unwrap().is_empty());
}

#[tokio::test]
async fn cancel_order_restocks_and_removes_it() {
    let shop = shop().await;
    let (product, user_id) = seed(&shop, 4).await;

    let order = shop
        .orders
        .create_order(
            NewOrder {
                product_id: product.id.clone(),
                quantity: 3,
            },
            &user_id,
        )
        .await
        .unwrap()
        .order
        .unwrap();
    assert_eq!(shop.products.get_product_by_id(&product.id).await.unwrap().stock, 1);

    let message = shop.orders.cancel_order(&order.id).await.unwrap();
    assert_eq!(message, ORDER_CANCELLED_MESSAGE);
    assert_eq!(shop.products.get_product_by_id(&product.id).await.unwrap().stock, 4);

    let err = shop.orders.get_order_by_id(&order.id).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn product_update_over_rpc_is_idempotent() {
    let shop = shop().await;
    let (product, _) = seed(&shop, 10).await;
    let products = ProductEvents::new(client(&shop).await);

    let first = products
        .update_product(&product.id, ProductPatch::stock(5))
        .await
        .unwrap()
        .unwrap();
    let second = products
        .update_product(&product.id, ProductPatch::stock(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.stock, 5);
    assert_eq!(second.stock, 5);

    let fetched = products.get_product_by_id(&product.id).await.unwrap().unwrap();
    assert_eq!(fetched.stock, 5);
}

#[tokio::test]
async fn unknown_ids_map_to_none_or_not_found() {
    let shop = shop().await;
    let (_, user_id) = seed(&shop, 1).await;
    let products = ProductEvents::new(client(&shop).await);

    assert!(products.get_product_by_id("missing").await.unwrap().is_none());
    assert!(products
        .update_product("missing", ProductPatch::stock(1))
        .await
        .unwrap()
        .is_none());

    let err = shop
        .orders
        .create_order(
            NewOrder {
                product_id: "missing".to_string(),
                quantity: 1,
            },
            &user_id,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn cancel_that_would_overflow_stock_is_refused() {
    let shop = shop().await;
    let (product, user_id) = seed(&shop, 10).await;

    let order = shop
        .orders
        .create_order(
            NewOrder {
                product_id: product.id.clone(),
                quantity: 2,
            },
            &user_id,
        )
        .await
        .unwrap()
        .order
        .unwrap();

    let products = ProductEvents::new(client(&shop).await);
    products
        .update_product(&product.id, ProductPatch::stock(u32::MAX))
        .await
        .unwrap()
        .unwrap();

    let err = shop.orders.cancel_order(&order.id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert_eq!(shop.products.get_product_by_id(&product.id).await.unwrap().stock, u32::MAX);
    assert_eq!(shop.orders.get_order_by_id(&order.id).await.unwrap().id, order.id);
}

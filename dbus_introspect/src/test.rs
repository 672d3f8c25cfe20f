use crate::*;
use static_assertions::assert_impl_all;

const FREEDESKTOP: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node name="/org/freedesktop/DBus">
  <interface name="org.freedesktop.DBus">
    <method name="Hello">
      <arg direction="out" type="s"/>
    </method>
    <method name="RequestName">
      <arg direction="in" type="s"/>
      <arg direction="in" type="u"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="ListNames">
      <arg direction="out" type="as"/>
    </method>
    <signal name="NameOwnerChanged">
      <arg type="s"/>
      <arg type="s"/>
      <arg type="s"/>
    </signal>
    <property name="Features" type="as" access="read">
      <annotation name="org.freedesktop.DBus.Property.EmitsChangedSignal" value="const"/>
    </property>
  </interface>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg direction="out" type="s"/>
    </method>
  </interface>
  <node name="Foo"/>
  <node name="Bar">
    <interface name="com.example.Hidden"/>
  </node>
</node>
"#;

#[test]
fn test_freedesktop() {
    let intro = Introspect::try_from(FREEDESKTOP).unwrap();
    assert_eq!(intro.name.as_deref(), Some("/org/freedesktop/DBus"));
    assert_eq!(
        intro.interface_keys,
        vec!["org.freedesktop.DBus", "org.freedesktop.DBus.Introspectable"]
    );
    assert_eq!(intro.children, vec!["Foo", "Bar"]);
    assert!(intro.interface("com.example.Hidden").is_none());

    let bus = intro.interface("org.freedesktop.DBus").unwrap();
    let request_name = bus.method("RequestName").unwrap();
    assert_eq!(request_name.in_signature(), "su");
    assert_eq!(request_name.out_signature(), "u");
    assert_eq!(bus.method("Hello").unwrap().in_signature(), "");
    assert_eq!(bus.method("ListNames").unwrap().out_signature(), "as");
    assert!(bus.method("Goodbye").is_none());

    let signal = bus.signal("NameOwnerChanged").unwrap();
    assert_eq!(signal.signature(), "sss");
    assert!(signal.args.iter().all(|a| a.direction == Direction::Out));

    let features = bus.property("Features").unwrap();
    assert_eq!(features.signature, "as");
    assert_eq!(features.access, Access::Read);
}

#[test]
fn test_empty_method_and_interface() {
    let intro = Introspect::try_from(
        r#"<node><interface name="a.B"><method name="Nop"/></interface><interface name="c.D"/></node>"#,
    )
    .unwrap();
    assert!(intro.interface("a.B").unwrap().method("Nop").unwrap().args.is_empty());
    assert!(intro.interface("c.D").unwrap().methods.is_empty());
}

#[test]
fn test_empty_node() {
    let intro = Introspect::try_from("<node/>").unwrap();
    assert!(intro.is_empty());
    assert!(intro.children.is_empty());
}

#[test]
fn test_no_root() {
    match Introspect::try_from("") {
        Err(Error::NoRootNode) => {}
        other => panic!("Expected NoRootNode, got {:?}", other),
    }
}

#[test]
fn test_missing_type() {
    match Introspect::try_from(
        r#"<node><interface name="a.B"><method name="M"><arg name="x"/></method></interface></node>"#,
    ) {
        Err(Error::MissingAttribute {
            element: "arg",
            attribute: "type",
        }) => {}
        other => panic!("Expected MissingAttribute, got {:?}", other),
    }
}

#[test]
fn test_invalid_direction() {
    let e = Introspect::try_from(
        r#"<node><interface name="a.B"><method name="M"><arg type="s" direction="sideways"/></method></interface></node>"#,
    )
    .unwrap_err();
    assert!(matches!(e, Error::InvalidAttribute { attribute: "direction", .. }));
}

#[test]
fn test_duplicate_method() {
    let e = Introspect::try_from(
        r#"<node><interface name="a.B"><method name="M"/><method name="M"/></interface></node>"#,
    )
    .unwrap_err();
    assert_eq!(e.to_string(), "Multiple definitions of method 'a.B.M'");
}

#[test]
fn test_arg_outside_member() {
    let e = Introspect::try_from(r#"<node><interface name="a.B"><arg type="s"/></interface></node>"#)
        .unwrap_err();
    assert!(matches!(e, Error::UnexpectedElement(ref n) if n == "arg"));
}

#[test]
fn test_display() {
    let intro = Introspect::try_from(
        r#"<node>
  <interface name="com.example.Echo">
    <method name="Ping">
      <arg name="msg" type="s" direction="in"/>
      <arg type="s" direction="out"/>
    </method>
    <signal name="Pinged"><arg name="msg" type="s"/></signal>
    <property name="Count" type="u" access="readwrite"/>
  </interface>
  <node name="sub"/>
</node>"#,
    )
    .unwrap();

    assert_eq!(
        intro.to_string(),
        "\
interface com.example.Echo
  method Ping(msg: s) -> (s)
  signal Pinged(msg: s)
  property readwrite Count: u

node sub"
    );
}

#[test]
fn test_serialize() {
    let intro = Introspect::try_from(
        r#"<node><interface name="a.B"><method name="M"><arg name="x" type="i"/></method></interface></node>"#,
    )
    .unwrap();
    let v = serde_json::to_value(&intro).unwrap();
    assert_eq!(v["interfaces"]["a.B"]["methods"]["M"]["args"][0]["type"], "i");
    assert_eq!(v["interfaces"]["a.B"]["methods"]["M"]["args"][0]["direction"], "in");
}

#[test]
fn error_is_sync_send() {
    assert_impl_all!(Error: Send, Sync);
}
